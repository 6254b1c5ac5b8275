// ABOUTME: Metrics and observability for the kernel pool
//
// Tracks:
// - Kernels: started, stopped, evicted by the sweeper, creation failures
// - Executions: total submitted
// - Active kernel count

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Pool-level metrics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub kernels_started: AtomicU64,
    pub kernels_stopped: AtomicU64,
    pub kernels_evicted: AtomicU64,
    pub creation_failures: AtomicU64,
    pub executions: AtomicU64,
    pub active_kernels: AtomicU32,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel_started(&self) {
        self.kernels_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn kernel_stopped(&self) {
        self.kernels_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn kernel_evicted(&self) {
        self.kernels_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn creation_failed(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_started(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_kernels(&self, count: u32) {
        self.active_kernels.store(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            kernels_started: self.kernels_started.load(Ordering::Relaxed),
            kernels_stopped: self.kernels_stopped.load(Ordering::Relaxed),
            kernels_evicted: self.kernels_evicted.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            active_kernels: self.active_kernels.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub kernels_started: u64,
    pub kernels_stopped: u64,
    pub kernels_evicted: u64,
    pub creation_failures: u64,
    pub executions: u64,
    pub active_kernels: u32,
}
