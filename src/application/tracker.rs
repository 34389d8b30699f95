//! The tracker engine.
//!
//! Orchestrates the whole pipeline: validates configuration, computes event
//! identities, routes events through the storage adapter's atomic `track`,
//! publishes lifecycle notifications, and runs the deferred-event processing
//! loop with bounded retry.

use crate::application::config::{ConfigError, TrackerConfig};
use crate::application::metrics::Metrics;
use crate::application::notify::{IgnoredEvent, TrackerNotification, NOTIFICATION_CAPACITY};
use crate::application::ports::{Clock, EventProcessor, StorageAdapter, StorageError};
use crate::domain::identity::{self, IdentityError};
use crate::domain::record::{ConfigPatch, EventRecord, NewEvent, RecordConfig};
use crate::domain::strategy::{IgnoreReason, Outcome, Strategy, StrategyConfigError};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::memory::MemoryAdapter;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

/// Top-level error type of the engine.
#[derive(Debug)]
pub enum TrackerError {
    /// Invalid event identifiers
    Identity(IdentityError),
    /// Invalid engine configuration
    Config(ConfigError),
    /// Invalid strategy parameters
    Strategy(StrategyConfigError),
    /// The backing store failed
    Storage(StorageError),
    /// The engine was destroyed
    Destroyed,
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Identity(e) => write!(f, "invalid event identity: {e}"),
            TrackerError::Config(e) => write!(f, "invalid tracker configuration: {e}"),
            TrackerError::Strategy(e) => write!(f, "invalid strategy configuration: {e}"),
            TrackerError::Storage(e) => write!(f, "{e}"),
            TrackerError::Destroyed => write!(f, "tracker has been destroyed"),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::Identity(e) => Some(e),
            TrackerError::Config(e) => Some(e),
            TrackerError::Strategy(e) => Some(e),
            TrackerError::Storage(e) => Some(e),
            TrackerError::Destroyed => None,
        }
    }
}

impl From<IdentityError> for TrackerError {
    fn from(e: IdentityError) -> Self {
        TrackerError::Identity(e)
    }
}

impl From<ConfigError> for TrackerError {
    fn from(e: ConfigError) -> Self {
        TrackerError::Config(e)
    }
}

impl From<StrategyConfigError> for TrackerError {
    fn from(e: StrategyConfigError) -> Self {
        TrackerError::Strategy(e)
    }
}

impl From<StorageError> for TrackerError {
    fn from(e: StorageError) -> Self {
        TrackerError::Storage(e)
    }
}

/// Result of tracking one event.
#[derive(Debug, Clone)]
pub struct TrackedEvent {
    /// The decision made for this event
    pub outcome: Outcome,
    /// The stored record after the decision; `None` when the key limit
    /// rejected a new identity
    pub record: Option<EventRecord>,
    /// Present iff the event was ignored
    pub reason: Option<IgnoreReason>,
}

struct TrackerInner<S> {
    adapter: S,
    config: TrackerConfig,
    base_config: RecordConfig,
    strategy: Strategy,
    clock: Arc<dyn Clock>,
    notifications: broadcast::Sender<TrackerNotification>,
    metrics: Metrics,
    processor: RwLock<Option<Arc<dyn EventProcessor>>>,
    destroyed: AtomicBool,
    loop_shutdown: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Event aggregation and throttling engine.
///
/// Accepts a stream of `(category, id, details)` events and decides, per
/// identity, whether each event passes through immediately, is deferred for
/// batch processing, or is ignored. Deferred identities are released to a
/// user-supplied [`EventProcessor`] by a background loop.
///
/// The engine is cheap to clone; clones share all state.
///
/// # Shutdown
///
/// Call [`destroy`](Self::destroy) when done. It stops the processing loop,
/// releases adapter resources (the in-process adapter's purge sweep), and is
/// the point after which [`track_event`](Self::track_event) fails with
/// [`TrackerError::Destroyed`]. Dropping the engine without destroying it
/// leaves the background loops running.
pub struct EventTracker<S> {
    inner: Arc<TrackerInner<S>>,
}

impl<S> Clone for EventTracker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for EventTracker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTracker")
            .field("config", &self.inner.config)
            .field("strategy", &self.inner.strategy)
            .finish_non_exhaustive()
    }
}

impl EventTracker<MemoryAdapter> {
    /// Create an engine over the default in-process adapter.
    ///
    /// Must be called inside a tokio runtime when `purge_interval` is
    /// non-zero, since the adapter spawns its expiry sweep.
    ///
    /// # Errors
    /// Returns a configuration error before any resource is acquired.
    pub fn new(config: TrackerConfig, strategy: Strategy) -> Result<Self, TrackerError> {
        // Validate before the adapter exists so a bad config leaks nothing.
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let adapter = MemoryAdapter::with_options(config.purge_interval, Arc::clone(&clock));
        Self::with_storage_and_clock(adapter, config, strategy, clock)
    }
}

impl<S: StorageAdapter + 'static> EventTracker<S> {
    /// Create an engine over a custom storage adapter.
    pub fn with_storage(
        adapter: S,
        config: TrackerConfig,
        strategy: Strategy,
    ) -> Result<Self, TrackerError> {
        Self::with_storage_and_clock(adapter, config, strategy, Arc::new(SystemClock::new()))
    }

    /// Create an engine over a custom storage adapter and clock.
    pub fn with_storage_and_clock(
        adapter: S,
        config: TrackerConfig,
        strategy: Strategy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TrackerError> {
        config.validate()?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let base_config = config.base_record_config();
        Ok(Self {
            inner: Arc::new(TrackerInner {
                adapter,
                config,
                base_config,
                strategy,
                clock,
                notifications,
                metrics: Metrics::new(),
                processor: RwLock::new(None),
                destroyed: AtomicBool::new(false),
                loop_shutdown: Mutex::new(None),
                loop_handle: Mutex::new(None),
            }),
        })
    }

    /// Compute the composite key for an identity.
    ///
    /// # Errors
    /// Rejects empty identifiers.
    pub fn generate_composite_key(category: &str, id: &str) -> Result<String, TrackerError> {
        Ok(identity::composite_key(category, id)?)
    }

    /// Compute the fingerprint of a details payload. Never fails; see
    /// [`identity::details_hash`].
    pub fn generate_details_hash(details: &Value) -> String {
        identity::details_hash(details)
    }

    /// Track one event.
    ///
    /// Computes the identity and payload fingerprint, runs the adapter's
    /// atomic `track`, publishes the matching lifecycle notification, and
    /// returns the decision.
    ///
    /// # Errors
    /// Rejects empty identifiers, surfaces storage failures, and fails with
    /// [`TrackerError::Destroyed`] after [`destroy`](Self::destroy).
    pub async fn track_event(
        &self,
        category: &str,
        id: &str,
        details: Option<Value>,
    ) -> Result<TrackedEvent, TrackerError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(TrackerError::Destroyed);
        }

        let key = identity::composite_key(category, id)?;
        let details = details.unwrap_or(Value::Null);
        let details_hash = identity::details_hash(&details);
        let event = NewEvent {
            category: category.to_string(),
            id: id.to_string(),
            details: details.clone(),
            details_hash,
        };

        let result = self
            .inner
            .adapter
            .track(
                &key,
                event,
                &self.inner.base_config,
                self.inner.config.max_keys,
                &self.inner.strategy,
            )
            .await?;

        match result.outcome {
            Outcome::Immediate => {
                self.inner.metrics.record_immediate();
                if let Some(record) = &result.record {
                    self.notify(TrackerNotification::Immediate(record.clone()));
                }
            }
            Outcome::Deferred => {
                self.inner.metrics.record_deferred();
                if let Some(record) = &result.record {
                    self.notify(TrackerNotification::Deferred(record.clone()));
                }
            }
            Outcome::Ignored => {
                self.inner.metrics.record_ignored();
                self.notify(TrackerNotification::Ignored(IgnoredEvent {
                    reason: result.reason.unwrap_or(IgnoreReason::AlreadyDeferred),
                    category: category.to_string(),
                    id: id.to_string(),
                    details,
                }));
            }
        }

        Ok(TrackedEvent {
            outcome: result.outcome,
            record: result.record,
            reason: result.reason,
        })
    }

    /// Release due deferred events.
    ///
    /// Without a processor this is a non-destructive query of what is due.
    /// With a processor, due events are atomically removed from storage and
    /// handed over; a failing processor is retried up to `max_retries` times
    /// with exponential backoff, after which the batch is surfaced through
    /// `process_failed` and `error` notifications. Either way the removed
    /// events are returned.
    pub async fn process_deferred_events(&self) -> Result<Vec<EventRecord>, TrackerError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(TrackerError::Destroyed);
        }

        let now = self.inner.clock.now_ms();
        let processor = self.inner.processor.read().await.clone();
        let Some(processor) = processor else {
            return Ok(self.inner.adapter.find_due_deferred(now).await?);
        };

        let events = self.inner.adapter.pop_due_deferred(now).await?;
        if events.is_empty() {
            return Ok(events);
        }

        let max_retries = self.inner.config.max_retries;
        let mut attempt: u32 = 0;
        loop {
            match processor.process(events.clone()).await {
                Ok(()) => {
                    self.inner.metrics.record_processed(events.len() as u64);
                    for record in &events {
                        self.notify(TrackerNotification::Processed(record.clone()));
                    }
                    return Ok(events);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt > max_retries {
                        tracing::warn!(
                            error = %error,
                            attempts = attempt,
                            events = events.len(),
                            "deferred batch dropped after retry exhaustion"
                        );
                        self.inner.metrics.record_process_failure();
                        self.notify(TrackerNotification::ProcessFailed {
                            error: error.to_string(),
                            events: events.clone(),
                            attempts: attempt,
                        });
                        self.notify(TrackerNotification::Error(error.to_string()));
                        return Ok(events);
                    }

                    // Delay on attempt k (0-indexed) is retry_delay * 2^k.
                    let delay_ms = self
                        .inner
                        .config
                        .retry_delay
                        .saturating_mul(1u64 << (attempt - 1).min(63));
                    self.notify(TrackerNotification::Retry {
                        attempt,
                        max_retries,
                        delay_ms,
                        events: events.clone(),
                    });
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Merge a config patch into one identity's snapshot.
    ///
    /// Returns `false` if the identity is not present. On success a
    /// `config_updated` notification carries the fresh record.
    pub async fn update_config(
        &self,
        category: &str,
        id: &str,
        patch: ConfigPatch,
    ) -> Result<bool, TrackerError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(TrackerError::Destroyed);
        }

        let key = identity::composite_key(category, id)?;
        let updated = self
            .inner
            .adapter
            .update(&key, &move |mut record: EventRecord| {
                record.config.merge(&patch);
                record
            })
            .await?;

        match updated {
            Some(record) => {
                self.notify(TrackerNotification::ConfigUpdated(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of all currently deferred records regardless of schedule.
    pub async fn get_deferred_events(&self) -> Result<Vec<EventRecord>, TrackerError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(TrackerError::Destroyed);
        }
        Ok(self.inner.adapter.find_all_deferred().await?)
    }

    /// Install the processor and start the processing loop.
    ///
    /// The loop is a single-shot timer rescheduled from the tail of each
    /// iteration, so invocations never overlap. It starts once; installing a
    /// new processor replaces the callback without restarting the loop.
    pub async fn set_processor(&self, processor: impl EventProcessor + 'static) {
        *self.inner.processor.write().await = Some(Arc::new(processor));
        self.start_processing_loop();
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerNotification> {
        self.inner.notifications.subscribe()
    }

    /// Engine metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// The frozen engine configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// The storage adapter backing this engine.
    pub fn storage(&self) -> &S {
        &self.inner.adapter
    }

    /// Shut the engine down.
    ///
    /// Marks the engine destroyed, stops the processing loop (an in-flight
    /// processor invocation completes first), and releases adapter resources.
    /// Idempotent.
    pub async fn destroy(&self) -> Result<(), TrackerError> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shutdown = self
            .inner
            .loop_shutdown
            .lock()
            .expect("loop shutdown lock poisoned")
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        let handle = self
            .inner
            .loop_handle
            .lock()
            .expect("loop handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.adapter.destroy().await?;
        Ok(())
    }

    fn notify(&self, notification: TrackerNotification) {
        // Send fails only when no subscriber exists, which is fine.
        let _ = self.inner.notifications.send(notification);
    }

    fn start_processing_loop(&self) {
        let mut slot = self
            .inner
            .loop_shutdown
            .lock()
            .expect("loop shutdown lock poisoned");
        if slot.is_some() || self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *slot = Some(tx);
        drop(slot);

        let tracker = self.clone();
        let interval = Duration::from_millis(self.inner.config.effective_processing_interval());
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = rx.changed() => {
                        if *rx.borrow_and_update() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        match tracker.process_deferred_events().await {
                            Ok(_) => {}
                            Err(TrackerError::Destroyed) => break,
                            Err(error) => {
                                tracing::warn!(error = %error, "deferred event processing failed");
                                tracker.notify(TrackerNotification::Error(error.to_string()));
                            }
                        }
                    }
                }
            }
        });

        *self
            .inner
            .loop_handle
            .lock()
            .expect("loop handle lock poisoned") = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::FnProcessor;
    use crate::infrastructure::mocks::MockClock;
    use serde_json::json;

    fn config() -> TrackerConfig {
        TrackerConfig {
            limit: 2,
            defer_interval: 100,
            expire_time: 200,
            purge_interval: 0,
            ..TrackerConfig::default()
        }
    }

    fn tracker_with_clock(
        config: TrackerConfig,
        strategy: Strategy,
        clock: Arc<MockClock>,
    ) -> EventTracker<MemoryAdapter> {
        let adapter =
            MemoryAdapter::with_options(0, clock.clone() as Arc<dyn Clock>);
        EventTracker::with_storage_and_clock(adapter, config, strategy, clock).unwrap()
    }

    #[tokio::test]
    async fn rejects_empty_identifiers() {
        let tracker = tracker_with_clock(
            config(),
            Strategy::simple(),
            Arc::new(MockClock::new(0)),
        );
        let result = tracker.track_event("", "id", None).await;
        assert!(matches!(result, Err(TrackerError::Identity(_))));

        let result = tracker.track_event("cat", "", None).await;
        assert!(matches!(result, Err(TrackerError::Identity(_))));
    }

    #[tokio::test]
    async fn zero_expire_time_fails_construction() {
        let bad = TrackerConfig {
            expire_time: 0,
            ..TrackerConfig::default()
        };
        let adapter = MemoryAdapter::with_options(0, Arc::new(MockClock::new(0)) as Arc<dyn Clock>);
        let result = EventTracker::with_storage(adapter, bad, Strategy::simple());
        assert!(matches!(result, Err(TrackerError::Config(_))));
    }

    #[tokio::test]
    async fn outcomes_follow_the_simple_counter() {
        let clock = Arc::new(MockClock::new(0));
        let tracker = tracker_with_clock(config(), Strategy::simple(), clock.clone());

        let first = tracker.track_event("auth", "login_fail", None).await.unwrap();
        assert_eq!(first.outcome, Outcome::Immediate);
        assert_eq!(first.record.as_ref().unwrap().count, 1);

        let second = tracker.track_event("auth", "login_fail", None).await.unwrap();
        assert_eq!(second.outcome, Outcome::Immediate);
        assert_eq!(second.record.as_ref().unwrap().count, 2);

        let third = tracker.track_event("auth", "login_fail", None).await.unwrap();
        assert_eq!(third.outcome, Outcome::Deferred);
        assert_eq!(third.record.as_ref().unwrap().count, 3);

        let fourth = tracker.track_event("auth", "login_fail", None).await.unwrap();
        assert_eq!(fourth.outcome, Outcome::Ignored);
        assert_eq!(fourth.reason, Some(IgnoreReason::AlreadyDeferred));

        let snapshot = tracker.metrics().snapshot();
        assert_eq!(snapshot.events_immediate, 2);
        assert_eq!(snapshot.events_deferred, 1);
        assert_eq!(snapshot.events_ignored, 1);
    }

    #[tokio::test]
    async fn notifications_carry_the_outcome() {
        let clock = Arc::new(MockClock::new(0));
        let tracker = tracker_with_clock(config(), Strategy::simple(), clock.clone());
        let mut rx = tracker.subscribe();

        tracker.track_event("auth", "login_fail", None).await.unwrap();
        let note = rx.recv().await.unwrap();
        assert_eq!(note.name(), "immediate");

        tracker.track_event("auth", "login_fail", None).await.unwrap();
        tracker.track_event("auth", "login_fail", None).await.unwrap();
        rx.recv().await.unwrap();
        let note = rx.recv().await.unwrap();
        assert_eq!(note.name(), "deferred");

        tracker.track_event("auth", "login_fail", None).await.unwrap();
        let note = rx.recv().await.unwrap();
        match note {
            TrackerNotification::Ignored(payload) => {
                assert_eq!(payload.reason, IgnoreReason::AlreadyDeferred);
                assert_eq!(payload.category, "auth");
                assert_eq!(payload.id, "login_fail");
            }
            other => panic!("expected ignored notification, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn without_processor_due_events_are_left_in_place() {
        let clock = Arc::new(MockClock::new(0));
        let tracker = tracker_with_clock(
            TrackerConfig {
                limit: 0,
                defer_interval: 50,
                ..config()
            },
            Strategy::simple(),
            clock.clone(),
        );

        tracker.track_event("auth", "login_fail", None).await.unwrap();
        clock.advance(60);

        let due = tracker.process_deferred_events().await.unwrap();
        assert_eq!(due.len(), 1);

        // Non-destructive: still there.
        let due = tracker.process_deferred_events().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(tracker.get_deferred_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_config_targets_one_identity() {
        let clock = Arc::new(MockClock::new(0));
        let tracker = tracker_with_clock(config(), Strategy::simple(), clock.clone());

        tracker.track_event("auth", "login_fail", None).await.unwrap();
        let changed = tracker
            .update_config(
                "auth",
                "login_fail",
                ConfigPatch {
                    limit: Some(10),
                    ..ConfigPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(changed);

        let record = tracker
            .storage()
            .get(&identity::composite_key("auth", "login_fail").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.config.limit, 10);

        let missing = tracker
            .update_config("auth", "unknown", ConfigPatch::default())
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn destroy_stops_the_engine() {
        let clock = Arc::new(MockClock::new(0));
        let tracker = tracker_with_clock(config(), Strategy::simple(), clock.clone());
        tracker
            .set_processor(FnProcessor(|_events: Vec<EventRecord>| async { Ok(()) }))
            .await;

        tracker.destroy().await.unwrap();
        let result = tracker.track_event("auth", "login_fail", None).await;
        assert!(matches!(result, Err(TrackerError::Destroyed)));

        // Idempotent.
        tracker.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn details_payload_travels_with_the_record() {
        let clock = Arc::new(MockClock::new(0));
        let tracker = tracker_with_clock(config(), Strategy::simple(), clock.clone());

        let tracked = tracker
            .track_event("auth", "login_fail", Some(json!({"ip": "1.1.1.1"})))
            .await
            .unwrap();
        let record = tracked.record.unwrap();
        assert_eq!(record.details, json!({"ip": "1.1.1.1"}));
        assert_eq!(record.details_hash.len(), 64);
    }
}
