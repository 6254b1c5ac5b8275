// ABOUTME: Background task evicting kernels that have been idle past a threshold
// ABOUTME: Each sweep runs in its own task so a failing iteration never ends the loop

//! Idle sweeper for the kernel pool.
//!
//! The `IdleSweeper` runs as a background task that:
//! - Wakes every `sweep_interval` (default one hour)
//! - Snapshots the keys idle longer than `idle_threshold` in one read pass
//! - Evicts them one by one through the pool's per-key locks
//!
//! # Usage
//!
//! ```ignore
//! let mut sweeper = IdleSweeper::new(Duration::from_secs(3600), Duration::from_secs(3600));
//! sweeper.start(Arc::clone(&pool));
//!
//! // Later, stop gracefully
//! sweeper.stop().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::keyed_pool::KernelPool;
use crate::config::PoolConfig;
use crate::error::Outcome;

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys found idle in the snapshot
    pub candidates: usize,

    /// Keys whose kernel was shut down
    pub evicted: Vec<String>,

    /// Keys whose teardown failed, with the error
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.candidates == 0
    }
}

/// Periodic eviction of idle kernels
pub struct IdleSweeper {
    /// Time between sweeps.
    interval: Duration,

    /// Inactivity after which a kernel is evicted.
    threshold: Duration,

    /// Wakes the loop for shutdown.
    shutdown: Arc<Notify>,

    /// Handle to the background task.
    handle: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    pub fn new(interval: Duration, threshold: Duration) -> Self {
        Self {
            interval,
            threshold,
            shutdown: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.sweep_interval, config.idle_threshold)
    }

    /// Start the background loop. Returns false if it is already running.
    pub fn start(&mut self, pool: Arc<KernelPool>) -> bool {
        if self.handle.is_some() {
            warn!("Idle sweeper already started");
            return false;
        }

        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let threshold = self.threshold;

        self.handle = Some(tokio::spawn(async move {
            Self::sweep_loop(pool, interval, threshold, shutdown).await;
        }));

        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "Idle sweeper started"
        );
        true
    }

    /// Stop the loop and wait for it to finish.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // notify_one stores a permit, so a loop not yet waiting still sees it
        self.shutdown.notify_one();
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Idle sweeper did not stop in time");
        }

        info!("Idle sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Perform a single sweep over `pool`.
    ///
    /// Failures on one key are logged and recorded; the remaining keys are
    /// still swept.
    pub async fn sweep_once(pool: &KernelPool, threshold: Duration) -> SweepReport {
        let candidates = pool.idle_keys(Utc::now(), threshold);
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        for key in candidates {
            match pool.evict_if_idle(&key, threshold).await {
                Ok(Outcome::Applied) => report.evicted.push(key),
                Ok(Outcome::Absent) => {}
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to evict idle kernel");
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        report
    }

    async fn sweep_loop(
        pool: Arc<KernelPool>,
        interval: Duration,
        threshold: Duration,
        shutdown: Arc<Notify>,
    ) {
        debug!("Idle sweep loop started");

        loop {
            let iteration = {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { Self::sweep_once(&pool, threshold).await })
            };

            match iteration.await {
                Ok(report) if report.is_empty() => {
                    debug!(kernels = pool.len(), "No idle kernels");
                }
                Ok(report) => {
                    info!(
                        evicted = report.evicted.len(),
                        failed = report.failed.len(),
                        remaining = pool.len(),
                        "Idle sweep finished"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Idle sweep iteration aborted");
                }
            }

            // Sweep first, then wait
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = shutdown.notified() => {
                    debug!("Idle sweep loop received shutdown signal");
                    break;
                }
            }
        }

        debug!("Idle sweep loop ended");
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
