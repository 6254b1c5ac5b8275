// ABOUTME: Per-key async locks created on demand under one short-lived registry lock

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

/// Lock serializing every mutating operation on one key
pub type KeyLock = Arc<AsyncMutex<()>>;

/// Maps a key to its dedicated lock
///
/// The registry mutex only guards map bookkeeping and is never held across
/// an await point; the returned per-key locks are what callers hold while
/// spawning or tearing down kernels.
#[derive(Debug, Default)]
pub struct KeyLockRegistry {
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl KeyLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock dedicated to `key`, created if absent
    pub fn acquire(&self, key: &str) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Drop the lock entry for `key`
    ///
    /// Callers must have left the key's critical section and dropped their
    /// clone of the lock first. The entry is kept while anyone else still
    /// holds a clone (a task waiting on it, or inside its critical section),
    /// so two tasks can never end up serialized on different lock objects
    /// for the same key. Returns whether the entry was removed.
    pub fn release(&self, key: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(key) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Number of keys with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}
