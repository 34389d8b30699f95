//! Per-key cooperative mutexes.
//!
//! The in-process adapter serializes all operations touching one identity
//! while letting operations on distinct identities interleave freely. Locks
//! are created on demand and removed once the last holder or waiter is gone,
//! so the table tracks current contention rather than every key ever seen.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of per-key async mutexes.
///
/// Tokio's mutex queues waiters in FIFO order, which gives each identity
/// fair, arrival-ordered access.
#[derive(Debug, Clone, Default)]
pub struct KeyLockTable {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind earlier holders.
    pub async fn lock(&self, key: &str) -> KeyLockGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;
        KeyLockGuard {
            table: Arc::clone(&self.locks),
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of keys currently holding a lock entry.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Guard for one key's lock; releasing it reclaims the table entry when no
/// other holder or waiter remains.
pub struct KeyLockGuard {
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Two strong references left (the table's and ours) means nobody else
        // holds or waits on this lock; remove_if re-checks under the shard
        // lock so a concurrent `lock()` keeps the entry alive.
        if Arc::strong_count(&self.lock) <= 2 {
            self.table
                .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
        }
    }
}
