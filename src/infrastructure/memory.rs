//! In-process storage adapter.
//!
//! Keeps records in a concurrent map with a parallel deferred index, so the
//! "what is due now?" scan is linear in the number of deferred identities
//! rather than in all identities. A per-key cooperative mutex serializes all
//! operations on one identity; operations on distinct identities proceed in
//! parallel.
//!
//! Every record crossing the adapter boundary is an owned clone, so callers
//! can never mutate stored state through a returned value.

use crate::application::ports::{Clock, StorageAdapter, StorageError, TrackResult};
use crate::domain::record::{EventRecord, NewEvent, RecordConfig};
use crate::domain::strategy::{IgnoreReason, Outcome, Strategy, ThrottleStrategy};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::keylock::KeyLockTable;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default expiry sweep interval in milliseconds.
pub const DEFAULT_PURGE_INTERVAL_MS: u64 = 60_000;

/// In-process storage adapter backed by concurrent maps.
///
/// Owns a periodic purge task that deletes expired records; call
/// [`destroy`](StorageAdapter::destroy) (directly or through the engine) to
/// stop it. With `purge_interval` 0 the sweep is disabled and expired records
/// are only reaped lazily by the freshness rule inside `track`.
#[derive(Debug)]
pub struct MemoryAdapter {
    records: Arc<DashMap<String, EventRecord>>,
    deferred: Arc<DashMap<String, u64>>,
    locks: KeyLockTable,
    /// Serializes admission of new identities when `max_keys` applies.
    admission: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
    purge_shutdown: Mutex<Option<watch::Sender<bool>>>,
    purge_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    /// Create an adapter with the default purge interval and system clock.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_PURGE_INTERVAL_MS, Arc::new(SystemClock::new()))
    }

    /// Create an adapter with an explicit purge interval and clock.
    ///
    /// The purge task is spawned only when `purge_interval_ms` is non-zero
    /// and a tokio runtime is available.
    pub fn with_options(purge_interval_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let adapter = Self {
            records: Arc::new(DashMap::new()),
            deferred: Arc::new(DashMap::new()),
            locks: KeyLockTable::new(),
            admission: tokio::sync::Mutex::new(()),
            clock,
            purge_shutdown: Mutex::new(None),
            purge_handle: Mutex::new(None),
        };
        if purge_interval_ms > 0 {
            adapter.start_purge_loop(purge_interval_ms);
        }
        adapter
    }

    fn start_purge_loop(&self, interval_ms: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime; purge sweep disabled");
            return;
        };

        let (tx, mut rx) = watch::channel(false);
        let records = Arc::clone(&self.records);
        let deferred = Arc::clone(&self.deferred);
        let locks = self.locks.clone();
        let clock = Arc::clone(&self.clock);
        let interval = Duration::from_millis(interval_ms);

        let task = handle.spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = rx.changed() => {
                        if *rx.borrow_and_update() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let now = clock.now_ms();
                        let stale: Vec<String> = records
                            .iter()
                            .filter(|entry| entry.value().is_expired(now))
                            .map(|entry| entry.key().clone())
                            .collect();

                        let mut purged = 0usize;
                        for key in stale {
                            let _guard = locks.lock(&key).await;
                            let expired = records
                                .get(&key)
                                .map(|record| record.is_expired(now))
                                .unwrap_or(false);
                            if expired {
                                records.remove(&key);
                                deferred.remove(&key);
                                purged += 1;
                            }
                        }
                        if purged > 0 {
                            tracing::debug!(purged, "expired records swept");
                        }
                    }
                }
            }
        });

        *self
            .purge_shutdown
            .lock()
            .expect("purge shutdown lock poisoned") = Some(tx);
        *self.purge_handle.lock().expect("purge handle lock poisoned") = Some(task);
    }

    /// Apply the deferred-index invariant for one stored record.
    fn index_record(&self, key: &str, record: &EventRecord) {
        match (record.deferred, record.scheduled_send_at) {
            (true, Some(scheduled)) => {
                self.deferred.insert(key.to_string(), scheduled);
            }
            _ => {
                self.deferred.remove(key);
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn get(&self, key: &str) -> Result<Option<EventRecord>, StorageError> {
        let _guard = self.locks.lock(key).await;
        Ok(self.records.get(key).map(|record| record.clone()))
    }

    async fn set(&self, key: &str, record: EventRecord) -> Result<(), StorageError> {
        let _guard = self.locks.lock(key).await;
        self.index_record(key, &record);
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.locks.lock(key).await;
        self.deferred.remove(key);
        Ok(self.records.remove(key).is_some())
    }

    async fn update(
        &self,
        key: &str,
        apply: &(dyn Fn(EventRecord) -> EventRecord + Send + Sync),
    ) -> Result<Option<EventRecord>, StorageError> {
        let _guard = self.locks.lock(key).await;
        let Some(record) = self.records.get(key).map(|record| record.clone()) else {
            return Ok(None);
        };
        let updated = apply(record);
        self.index_record(key, &updated);
        self.records.insert(key.to_string(), updated.clone());
        Ok(Some(updated))
    }

    async fn size(&self) -> Result<usize, StorageError> {
        Ok(self.records.len())
    }

    async fn acquire_key_slot(&self, key: &str, max_keys: usize) -> Result<bool, StorageError> {
        if self.records.contains_key(key) || max_keys == 0 {
            return Ok(true);
        }
        Ok(self.records.len() < max_keys)
    }

    async fn track(
        &self,
        key: &str,
        event: NewEvent,
        defaults: &RecordConfig,
        max_keys: usize,
        strategy: &Strategy,
    ) -> Result<TrackResult, StorageError> {
        let _guard = self.locks.lock(key).await;
        let now = self.clock.now_ms();

        let prior = self.records.get(key).map(|record| record.clone());
        let key_exists = prior.is_some();
        let fresh_prior = prior
            .filter(|record| !record.is_expired(now) && record.details_hash == event.details_hash);

        // New identities are admitted under a global lock so concurrent
        // tracks for distinct keys cannot oversubscribe `max_keys`.
        let _admission = if fresh_prior.is_none() && !key_exists && max_keys > 0 {
            let guard = self.admission.lock().await;
            if self.records.len() >= max_keys {
                return Ok(TrackResult {
                    outcome: Outcome::Ignored,
                    reason: Some(IgnoreReason::KeyLimitReached),
                    record: None,
                });
            }
            Some(guard)
        } else {
            None
        };

        let decision = strategy.decide(key, fresh_prior.as_ref(), &event, now, defaults);
        let reason =
            (decision.outcome == Outcome::Ignored).then_some(IgnoreReason::AlreadyDeferred);

        self.index_record(key, &decision.record);
        self.records.insert(key.to_string(), decision.record.clone());

        Ok(TrackResult {
            outcome: decision.outcome,
            reason,
            record: Some(decision.record),
        })
    }

    async fn find_due_deferred(&self, now_ms: u64) -> Result<Vec<EventRecord>, StorageError> {
        let due_keys: Vec<String> = self
            .deferred
            .iter()
            .filter(|entry| *entry.value() <= now_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let mut due = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            if let Some(record) = self.records.get(&key) {
                if record.is_due(now_ms) {
                    due.push(record.clone());
                }
            }
        }
        due.sort_by_key(|record| record.scheduled_send_at);
        Ok(due)
    }

    async fn pop_due_deferred(&self, now_ms: u64) -> Result<Vec<EventRecord>, StorageError> {
        let due_keys: Vec<String> = self
            .deferred
            .iter()
            .filter(|entry| *entry.value() <= now_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let mut popped = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            let _guard = self.locks.lock(&key).await;
            let due_state = self.records.get(&key).map(|record| record.is_due(now_ms));
            match due_state {
                Some(true) => {
                    if let Some((_, record)) = self.records.remove(&key) {
                        self.deferred.remove(&key);
                        popped.push(record);
                    }
                }
                Some(false) => {
                    // Rescheduled or released since the scan; leave it alone.
                }
                None => {
                    self.deferred.remove(&key);
                }
            }
        }
        popped.sort_by_key(|record| record.scheduled_send_at);
        Ok(popped)
    }

    async fn find_all_deferred(&self) -> Result<Vec<EventRecord>, StorageError> {
        let keys: Vec<String> = self
            .deferred
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut all = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.records.get(&key) {
                if record.deferred {
                    all.push(record.clone());
                }
            }
        }
        all.sort_by_key(|record| record.scheduled_send_at);
        Ok(all)
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let shutdown = self
            .purge_shutdown
            .lock()
            .expect("purge shutdown lock poisoned")
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        let handle = self
            .purge_handle
            .lock()
            .expect("purge handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use serde_json::json;

    fn defaults() -> RecordConfig {
        RecordConfig {
            limit: 2,
            defer_interval: 100,
            expire_time: 1_000,
            bucket_size: None,
            refill_rate: None,
            window_size: None,
        }
    }

    fn new_event(details_hash: &str) -> NewEvent {
        NewEvent {
            category: "auth".into(),
            id: "login_fail".into(),
            details: json!({"ip": "1.1.1.1"}),
            details_hash: details_hash.into(),
        }
    }

    fn adapter(clock: Arc<MockClock>) -> MemoryAdapter {
        MemoryAdapter::with_options(0, clock as Arc<dyn Clock>)
    }

    #[tokio::test]
    async fn track_creates_and_counts() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();

        let first = adapter
            .track("k1", new_event("h"), &defaults(), 0, &strategy)
            .await
            .unwrap();
        assert_eq!(first.outcome, Outcome::Immediate);
        assert_eq!(first.record.as_ref().unwrap().count, 1);

        let second = adapter
            .track("k1", new_event("h"), &defaults(), 0, &strategy)
            .await
            .unwrap();
        assert_eq!(second.record.as_ref().unwrap().count, 2);
        assert_eq!(adapter.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn changed_details_hash_reinitializes() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();

        adapter
            .track("k1", new_event("h1"), &defaults(), 0, &strategy)
            .await
            .unwrap();
        adapter
            .track("k1", new_event("h1"), &defaults(), 0, &strategy)
            .await
            .unwrap();

        let reset = adapter
            .track("k1", new_event("h2"), &defaults(), 0, &strategy)
            .await
            .unwrap();
        assert_eq!(reset.outcome, Outcome::Immediate);
        assert_eq!(reset.record.unwrap().count, 1);
    }

    #[tokio::test]
    async fn expired_record_reinitializes() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();

        adapter
            .track("k1", new_event("h"), &defaults(), 0, &strategy)
            .await
            .unwrap();
        clock.advance(1_001);

        let reset = adapter
            .track("k1", new_event("h"), &defaults(), 0, &strategy)
            .await
            .unwrap();
        assert_eq!(reset.record.unwrap().count, 1);
    }

    #[tokio::test]
    async fn max_keys_rejects_new_identities_only() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();

        adapter
            .track("k1", new_event("h"), &defaults(), 2, &strategy)
            .await
            .unwrap();
        adapter
            .track("k2", new_event("h"), &defaults(), 2, &strategy)
            .await
            .unwrap();

        let rejected = adapter
            .track("k3", new_event("h"), &defaults(), 2, &strategy)
            .await
            .unwrap();
        assert_eq!(rejected.outcome, Outcome::Ignored);
        assert_eq!(rejected.reason, Some(IgnoreReason::KeyLimitReached));
        assert!(rejected.record.is_none());

        // Existing identities still track.
        let existing = adapter
            .track("k1", new_event("h"), &defaults(), 2, &strategy)
            .await
            .unwrap();
        assert_eq!(existing.outcome, Outcome::Immediate);

        assert!(adapter.acquire_key_slot("k1", 2).await.unwrap());
        assert!(!adapter.acquire_key_slot("k4", 2).await.unwrap());
        assert!(adapter.acquire_key_slot("k4", 0).await.unwrap());
    }

    #[tokio::test]
    async fn deferred_index_follows_the_record() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();
        let config = RecordConfig {
            limit: 0,
            ..defaults()
        };

        adapter
            .track("k1", new_event("h"), &config, 0, &strategy)
            .await
            .unwrap();
        assert_eq!(adapter.find_all_deferred().await.unwrap().len(), 1);

        // Not yet due.
        assert!(adapter.find_due_deferred(50).await.unwrap().is_empty());
        assert_eq!(adapter.find_due_deferred(100).await.unwrap().len(), 1);

        // Deleting removes the index entry too.
        assert!(adapter.delete("k1").await.unwrap());
        assert!(adapter.find_all_deferred().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pop_due_is_destructive_and_exact() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();
        let config = RecordConfig {
            limit: 0,
            ..defaults()
        };

        adapter
            .track("early", new_event("h"), &config, 0, &strategy)
            .await
            .unwrap();
        clock.advance(500);
        adapter
            .track("late", new_event("h"), &config, 0, &strategy)
            .await
            .unwrap();

        // Only the first is due at t=100.
        let popped = adapter.pop_due_deferred(100).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].key, "early");
        assert_eq!(adapter.size().await.unwrap(), 1);

        let popped = adapter.pop_due_deferred(600).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].key, "late");
        assert_eq!(adapter.size().await.unwrap(), 0);
        assert!(adapter.find_all_deferred().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn returned_records_are_isolated_clones() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();

        let mut tracked = adapter
            .track("k1", new_event("h"), &defaults(), 0, &strategy)
            .await
            .unwrap()
            .record
            .unwrap();
        tracked.count = 999;
        tracked.details = json!({"tampered": true});

        let stored = adapter.get("k1").await.unwrap().unwrap();
        assert_eq!(stored.count, 1);
        assert_eq!(stored.details, json!({"ip": "1.1.1.1"}));
    }

    #[tokio::test]
    async fn update_preserves_index_and_returns_fresh_record() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = adapter(clock.clone());
        let strategy = Strategy::simple();

        adapter
            .track("k1", new_event("h"), &defaults(), 0, &strategy)
            .await
            .unwrap();

        let updated = adapter
            .update("k1", &|mut record| {
                record.deferred = true;
                record.scheduled_send_at = Some(42);
                record
            })
            .await
            .unwrap()
            .unwrap();
        assert!(updated.deferred);
        assert_eq!(adapter.find_due_deferred(42).await.unwrap().len(), 1);

        let missing = adapter.update("nope", &|record| record).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn purge_sweep_removes_expired_records() {
        let clock = Arc::new(MockClock::new(0));
        let adapter = MemoryAdapter::with_options(10, clock.clone() as Arc<dyn Clock>);
        let strategy = Strategy::simple();

        adapter
            .track("k1", new_event("h"), &defaults(), 0, &strategy)
            .await
            .unwrap();
        assert_eq!(adapter.size().await.unwrap(), 1);

        clock.advance(2_000);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(adapter.size().await.unwrap(), 0);
        adapter.destroy().await.unwrap();
    }
}
