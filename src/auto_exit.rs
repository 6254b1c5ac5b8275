// ABOUTME: Whole-process idle watchdog: resolves once no request has arrived for a configured time

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PoolConfig;

/// Tracks the last request and decides when the process should exit
#[derive(Debug)]
pub struct AutoExit {
    last_activity: Mutex<Instant>,
    idle_timeout: Option<Duration>,
    check_interval: Duration,
}

impl AutoExit {
    pub fn new(idle_timeout: Option<Duration>, check_interval: Duration) -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            idle_timeout,
            check_interval,
        }
    }

    /// Watchdog that never fires
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(300))
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.auto_exit_after, config.auto_exit_check_interval)
    }

    pub fn is_enabled(&self) -> bool {
        self.idle_timeout.is_some()
    }

    pub fn record_activity(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Resolve once the process has been idle longer than the timeout
    ///
    /// Never resolves when disabled.
    pub async fn wait_for_idle(&self) {
        let Some(timeout) = self.idle_timeout else {
            return std::future::pending().await;
        };

        info!(
            timeout_secs = timeout.as_secs(),
            check_secs = self.check_interval.as_secs(),
            "Auto exit enabled"
        );

        loop {
            let idle = self.idle_for();
            if idle > timeout {
                info!(idle_secs = idle.as_secs(), "No requests within auto exit timeout");
                return;
            }
            debug!(idle_secs = idle.as_secs(), "Auto exit check");
            tokio::time::sleep(self.check_interval).await;
        }
    }
}
