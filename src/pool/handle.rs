// ABOUTME: Pool record binding a key to one live kernel runtime and its activity time

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::runtime::KernelRuntime;

/// One pooled kernel
pub struct KernelHandle {
    key: String,
    kind: String,
    runtime: Arc<dyn KernelRuntime>,
    created_at: DateTime<Utc>,
    /// Milliseconds since the Unix epoch
    last_activity_ms: AtomicI64,
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity())
            .finish_non_exhaustive()
    }
}

impl KernelHandle {
    pub fn new(key: &str, kind: &str, runtime: Arc<dyn KernelRuntime>) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            kind: kind.to_string(),
            runtime,
            created_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Runtime reference, counting as activity
    pub fn runtime(&self) -> Arc<dyn KernelRuntime> {
        self.touch();
        Arc::clone(&self.runtime)
    }

    /// Runtime reference without touching the activity time
    pub(crate) fn runtime_untouched(&self) -> &Arc<dyn KernelRuntime> {
        &self.runtime
    }

    pub fn touch(&self) {
        self.set_last_activity(Utc::now());
    }

    pub fn set_last_activity(&self, at: DateTime<Utc>) {
        self.last_activity_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.created_at)
    }

    /// How long the handle has been idle as of `now`
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the handle has been idle strictly longer than `threshold`
    pub fn is_idle(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.idle_for(now) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeFactory;
    use crate::runtime::RuntimeFactory;

    fn handle() -> KernelHandle {
        let runtime = FakeFactory::new().create("python3").unwrap();
        KernelHandle::new("k1", "python3", runtime)
    }

    #[test]
    fn test_new_handle_is_fresh() {
        let handle = handle();
        assert_eq!(handle.key(), "k1");
        assert_eq!(handle.kind(), "python3");
        assert!(!handle.is_idle(Utc::now(), Duration::from_secs(1)));
    }

    #[test]
    fn test_backdated_handle_is_idle() {
        let handle = handle();
        handle.set_last_activity(Utc::now() - chrono::Duration::hours(2));

        assert!(handle.is_idle(Utc::now(), Duration::from_secs(3600)));
        assert!(handle.idle_for(Utc::now()) >= Duration::from_secs(7200));
    }

    #[test]
    fn test_runtime_access_touches() {
        let handle = handle();
        handle.set_last_activity(Utc::now() - chrono::Duration::hours(2));

        let _runtime = handle.runtime();
        assert!(!handle.is_idle(Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn test_untouched_access_keeps_activity() {
        let handle = handle();
        handle.set_last_activity(Utc::now() - chrono::Duration::hours(2));

        let _runtime = handle.runtime_untouched();
        assert!(handle.is_idle(Utc::now(), Duration::from_secs(3600)));
    }

    #[test]
    fn test_future_activity_is_not_idle() {
        let handle = handle();
        handle.set_last_activity(Utc::now() + chrono::Duration::minutes(5));
        assert_eq!(handle.idle_for(Utc::now()), Duration::ZERO);
    }
}
