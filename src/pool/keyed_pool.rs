// ABOUTME: Keyed kernel pool: lazy creation, at most one kernel per key, per-key serialization
// ABOUTME: Every check-then-create and check-then-delete runs under the key's own lock

//! Keyed kernel pool.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        KernelPool                          │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  entries: RwLock<HashMap<String, Arc<KernelHandle>>> │  │
//! │  │     - user-1 -> KernelHandle (python3)               │  │
//! │  │     - user-2 -> KernelHandle (python3)               │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                                                            │
//! │  ┌────────────────┐  ┌────────────────┐  ┌──────────────┐  │
//! │  │KeyLockRegistry │  │ RuntimeFactory │  │ PoolMetrics  │  │
//! │  │ (per-key locks)│  │ (spawns kinds) │  │(observability│  │
//! │  └────────────────┘  └────────────────┘  └──────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The entries map is only touched in short synchronous sections. Spawning,
//! restarting and tearing down kernels happen while holding the per-key
//! async lock, so operations on different keys never wait on each other.
//!
//! # Usage
//!
//! ```ignore
//! let pool = KernelPool::new(Arc::new(ProcessKernelFactory::from_config(&config)));
//!
//! let runtime = pool.fetch("user-1", "python3").await?;
//! let channel = runtime.open_channel();
//! runtime.submit("print('hi')").await?;
//!
//! pool.shutdown("user-1").await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::handle::KernelHandle;
use super::lock_registry::KeyLockRegistry;
use crate::error::{Outcome, PoolError, PoolResult};
use crate::metrics::PoolMetrics;
use crate::runtime::{KernelRuntime, RuntimeFactory};

/// Whether a key currently has a pooled kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    Running,
    Stopped,
}

impl KernelStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one pooled kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfo {
    pub key: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Pool of kernels keyed by caller-chosen ids
pub struct KernelPool {
    /// Live kernels by key; the single source of truth for "is this key running"
    entries: RwLock<HashMap<String, Arc<KernelHandle>>>,

    /// Per-key locks
    locks: KeyLockRegistry,

    /// Builds runtimes for kinds
    factory: Arc<dyn RuntimeFactory>,

    /// Pool-level metrics
    metrics: Arc<PoolMetrics>,
}

impl std::fmt::Debug for KernelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelPool")
            .field("kernel_count", &self.len())
            .field("lock_count", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl KernelPool {
    pub fn new(factory: Arc<dyn RuntimeFactory>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            locks: KeyLockRegistry::new(),
            factory,
            metrics: Arc::new(PoolMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub fn locks(&self) -> &KeyLockRegistry {
        &self.locks
    }

    /// Make sure a kernel exists for `key`, spawning one of `kind` if needed
    ///
    /// # Errors
    /// `PoolError::Creation` if the runtime cannot be built or started. Nothing
    /// is registered in that case, so a retry starts from scratch.
    pub async fn ensure_started(&self, key: &str, kind: &str) -> PoolResult<()> {
        if self.contains(key) {
            debug!(key = %key, "Kernel already running");
            return Ok(());
        }
        self.get_or_create(key, kind).await.map(|_| ())
    }

    /// Runtime for `key`, creating it first if absent; counts as activity
    pub async fn fetch(&self, key: &str, kind: &str) -> PoolResult<Arc<dyn KernelRuntime>> {
        let handle = self.get_or_create(key, kind).await?;
        Ok(handle.runtime())
    }

    /// `Running` if a kernel is registered for `key`
    ///
    /// Map membership only; a crashed kernel still reads as running until it
    /// is shut down or evicted.
    pub fn status(&self, key: &str) -> KernelStatus {
        if self.contains(key) {
            KernelStatus::Running
        } else {
            KernelStatus::Stopped
        }
    }

    /// Restart the kernel in place, or start one if absent
    pub async fn restart(&self, key: &str, kind: &str) -> PoolResult<()> {
        let lock = self.locks.acquire(key);
        let _guard = lock.lock().await;

        match self.get(key) {
            Some(handle) => {
                info!(key = %key, kind = %handle.kind(), "Restarting kernel");
                handle
                    .runtime()
                    .restart()
                    .await
                    .map_err(|e| PoolError::runtime(key, "restart", e))?;
                handle.touch();
                Ok(())
            }
            None => {
                debug!(key = %key, "Restart of absent kernel, starting it");
                self.create_locked(key, kind).await.map(|_| ())
            }
        }
    }

    /// Interrupt the kernel's current execution; nothing to do if absent
    pub async fn interrupt(&self, key: &str) -> PoolResult<Outcome> {
        let Some(handle) = self.get(key) else {
            debug!(key = %key, "Interrupt of absent kernel ignored");
            return Ok(Outcome::Absent);
        };

        info!(key = %key, "Interrupting kernel");
        handle
            .runtime()
            .interrupt()
            .await
            .map_err(|e| PoolError::runtime(key, "interrupt", e))?;
        Ok(Outcome::Applied)
    }

    /// Tear down and unregister the kernel for `key`; idempotent
    ///
    /// The entry is removed even when the runtime reports a teardown failure,
    /// since a half-dead kernel must not stay pooled. The error is still
    /// returned to the caller.
    pub async fn shutdown(&self, key: &str) -> PoolResult<Outcome> {
        let result = {
            let lock = self.locks.acquire(key);
            let _guard = lock.lock().await;
            self.shutdown_locked(key).await
        };

        // Only after the critical section is fully exited and our clone dropped
        self.locks.release(key);
        result
    }

    /// Shut down the kernel for `key` if it is still idle past `threshold`
    ///
    /// Idleness is checked again under the key's lock, so a kernel fetched
    /// after the sweeper's snapshot survives.
    pub async fn evict_if_idle(
        &self,
        key: &str,
        threshold: std::time::Duration,
    ) -> PoolResult<Outcome> {
        let result = {
            let lock = self.locks.acquire(key);
            let _guard = lock.lock().await;

            match self.get(key) {
                Some(handle) if handle.is_idle(Utc::now(), threshold) => {
                    info!(key = %key, idle_secs = handle.idle_for(Utc::now()).as_secs(), "Evicting idle kernel");
                    self.shutdown_locked(key).await
                }
                Some(_) => {
                    debug!(key = %key, "Kernel became active again, skipping eviction");
                    Ok(Outcome::Absent)
                }
                None => Ok(Outcome::Absent),
            }
        };

        if matches!(result, Ok(Outcome::Applied)) {
            self.metrics.kernel_evicted();
        }
        if !self.contains(key) {
            self.locks.release(key);
        }
        result
    }

    /// Shut down every pooled kernel, returning how many were stopped
    pub async fn shutdown_all(&self) -> usize {
        let keys = self.keys();
        info!(count = keys.len(), "Shutting down all kernels");

        let mut stopped = 0;
        for key in keys {
            match self.shutdown(&key).await {
                Ok(Outcome::Applied) => stopped += 1,
                Ok(Outcome::Absent) => {}
                Err(e) => warn!(key = %key, error = %e, "Kernel shutdown error"),
            }
        }
        stopped
    }

    /// Keys of all pooled kernels
    pub fn keys(&self) -> Vec<String> {
        self.read_entries().keys().cloned().collect()
    }

    /// Snapshot of all pooled kernels, sorted by key
    pub fn list(&self) -> Vec<KernelInfo> {
        let mut infos: Vec<KernelInfo> = self
            .read_entries()
            .values()
            .map(|handle| KernelInfo {
                key: handle.key().to_string(),
                kind: handle.kind().to_string(),
                created_at: handle.created_at(),
                last_activity: handle.last_activity(),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Handles idle longer than `threshold` as of `now`, collected in one read pass
    pub fn idle_keys(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> Vec<String> {
        self.read_entries()
            .iter()
            .filter(|(_, handle)| handle.is_idle(now, threshold))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Handle for `key` without counting as activity
    pub fn get(&self, key: &str) -> Option<Arc<KernelHandle>> {
        self.read_entries().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read_entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Existing handle (touched) or a freshly created one
    async fn get_or_create(&self, key: &str, kind: &str) -> PoolResult<Arc<KernelHandle>> {
        if let Some(handle) = self.get(key) {
            if handle.kind() != kind {
                debug!(key = %key, running = %handle.kind(), requested = %kind, "Kernel kind differs from request, reusing running kernel");
            }
            handle.touch();
            return Ok(handle);
        }

        let lock = self.locks.acquire(key);
        let _guard = lock.lock().await;

        // Someone may have created it while we waited for the lock
        if let Some(handle) = self.get(key) {
            handle.touch();
            return Ok(handle);
        }

        self.create_locked(key, kind).await
    }

    /// Spawn and register a kernel. Caller holds the key's lock.
    async fn create_locked(&self, key: &str, kind: &str) -> PoolResult<Arc<KernelHandle>> {
        info!(key = %key, kind = %kind, "Starting kernel");

        let runtime = self.factory.create(kind).map_err(|e| {
            self.metrics.creation_failed();
            error!(key = %key, kind = %kind, error = %e, "Kernel creation failed");
            PoolError::creation(key, e)
        })?;

        if let Err(e) = runtime.start().await {
            self.metrics.creation_failed();
            error!(key = %key, kind = %kind, error = %e, "Kernel failed to start");
            return Err(PoolError::creation(key, e));
        }

        let handle = Arc::new(KernelHandle::new(key, kind, runtime));
        self.write_entries()
            .insert(key.to_string(), Arc::clone(&handle));

        self.metrics.kernel_started();
        self.update_metrics();
        debug!(key = %key, "Kernel registered");
        Ok(handle)
    }

    /// Tear down and unregister. Caller holds the key's lock.
    async fn shutdown_locked(&self, key: &str) -> PoolResult<Outcome> {
        let Some(handle) = self.get(key) else {
            debug!(key = %key, "Shutdown of absent kernel ignored");
            return Ok(Outcome::Absent);
        };

        info!(key = %key, kind = %handle.kind(), "Shutting down kernel");
        let result = handle.runtime_untouched().shutdown().await;

        self.write_entries().remove(key);
        self.metrics.kernel_stopped();
        self.update_metrics();

        match result {
            Ok(()) => Ok(Outcome::Applied),
            Err(e) => {
                warn!(key = %key, error = %e, "Kernel teardown reported an error, entry removed");
                Err(PoolError::runtime(key, "shutdown", e))
            }
        }
    }

    fn update_metrics(&self) {
        let count = u32::try_from(self.len()).unwrap_or(u32::MAX);
        self.metrics.set_active_kernels(count);
    }

    fn read_entries(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<KernelHandle>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<KernelHandle>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
