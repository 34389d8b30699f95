//! End-to-end tracking scenarios over the in-process adapter.

use event_tracker::infrastructure::mocks::MockClock;
use event_tracker::{
    Clock, EventTracker, IgnoreReason, MemoryAdapter, Outcome, Strategy, TrackerConfig,
};
use serde_json::json;
use std::sync::Arc;

fn tracker(
    config: TrackerConfig,
    strategy: Strategy,
    clock: Arc<MockClock>,
) -> EventTracker<MemoryAdapter> {
    let adapter = MemoryAdapter::with_options(0, clock.clone() as Arc<dyn Clock>);
    EventTracker::with_storage_and_clock(adapter, config, strategy, clock).unwrap()
}

#[tokio::test]
async fn simple_counter_defers_after_limit() {
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(
        TrackerConfig {
            limit: 2,
            defer_interval: 100,
            expire_time: 200,
            ..TrackerConfig::default()
        },
        Strategy::simple(),
        clock.clone(),
    );

    let mut outcomes = Vec::new();
    let mut counts = Vec::new();
    for _ in 0..4 {
        let tracked = tracker.track_event("auth", "login_fail", None).await.unwrap();
        outcomes.push(tracked.outcome);
        counts.push(tracked.record.map(|r| r.count).unwrap_or(0));
    }

    assert_eq!(
        outcomes,
        vec![
            Outcome::Immediate,
            Outcome::Immediate,
            Outcome::Deferred,
            Outcome::Ignored
        ]
    );
    assert_eq!(counts, vec![1, 2, 3, 3]);
}

#[tokio::test]
async fn details_change_resets_the_count() {
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(
        TrackerConfig {
            limit: 2,
            defer_interval: 100,
            expire_time: 200,
            ..TrackerConfig::default()
        },
        Strategy::simple(),
        clock.clone(),
    );

    let first = tracker
        .track_event("auth", "login_fail", Some(json!({"ip": "1.1.1.1"})))
        .await
        .unwrap();
    let second = tracker
        .track_event("auth", "login_fail", Some(json!({"ip": "1.1.1.1"})))
        .await
        .unwrap();
    let third = tracker
        .track_event("auth", "login_fail", Some(json!({"ip": "2.2.2.2"})))
        .await
        .unwrap();

    assert_eq!(first.record.unwrap().count, 1);
    assert_eq!(second.record.unwrap().count, 2);
    assert_eq!(third.outcome, Outcome::Immediate);
    assert_eq!(third.record.unwrap().count, 1);
}

#[tokio::test]
async fn unchanged_details_keep_the_same_fingerprint() {
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(TrackerConfig::default(), Strategy::simple(), clock.clone());

    let first = tracker
        .track_event("auth", "login_fail", Some(json!({"ip": "1.1.1.1", "port": 22})))
        .await
        .unwrap();
    let second = tracker
        .track_event("auth", "login_fail", Some(json!({"port": 22, "ip": "1.1.1.1"})))
        .await
        .unwrap();

    let first = first.record.unwrap();
    let second = second.record.unwrap();
    assert_eq!(first.details_hash, second.details_hash);
    assert_eq!(second.count, 2);
}

#[tokio::test]
async fn max_keys_exhaustion_ignores_new_identities() {
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(
        TrackerConfig {
            max_keys: 2,
            ..TrackerConfig::default()
        },
        Strategy::simple(),
        clock.clone(),
    );

    assert_eq!(
        tracker.track_event("c", "1", None).await.unwrap().outcome,
        Outcome::Immediate
    );
    assert_eq!(
        tracker.track_event("c", "2", None).await.unwrap().outcome,
        Outcome::Immediate
    );

    let third = tracker.track_event("c", "3", None).await.unwrap();
    assert_eq!(third.outcome, Outcome::Ignored);
    assert_eq!(third.reason, Some(IgnoreReason::KeyLimitReached));
    assert!(third.record.is_none());

    // Existing identities keep tracking.
    let again = tracker.track_event("c", "1", None).await.unwrap();
    assert_eq!(again.outcome, Outcome::Immediate);
}

#[tokio::test]
async fn token_bucket_burst_then_deferral() {
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(
        TrackerConfig::default(),
        Strategy::token_bucket(5.0, 10.0).unwrap(),
        clock.clone(),
    );

    for i in 0..5 {
        let tracked = tracker.track_event("api", "burst", None).await.unwrap();
        assert_eq!(tracked.outcome, Outcome::Immediate, "event {i}");
    }

    let sixth = tracker.track_event("api", "burst", None).await.unwrap();
    assert_eq!(sixth.outcome, Outcome::Deferred);
    // One token missing at 10 tokens/s is a 100 ms wait.
    assert_eq!(sixth.record.unwrap().scheduled_send_at, Some(100));
}

#[tokio::test]
async fn sliding_window_drift() {
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(
        TrackerConfig {
            limit: 10,
            ..TrackerConfig::default()
        },
        Strategy::sliding_window(1_000).unwrap(),
        clock.clone(),
    );

    for _ in 0..10 {
        let tracked = tracker.track_event("api", "rate", None).await.unwrap();
        assert_eq!(tracked.outcome, Outcome::Immediate);
    }

    clock.set(500);
    let eleventh = tracker.track_event("api", "rate", None).await.unwrap();
    assert_eq!(eleventh.outcome, Outcome::Deferred);

    // Just past the boundary the previous window weighs 0.999: estimated
    // 9.99 < 10, so the next event goes through with count floor(10.99).
    clock.set(1_001);
    let next = tracker.track_event("api", "rate", None).await.unwrap();
    assert_eq!(next.outcome, Outcome::Immediate);
    assert_eq!(next.record.unwrap().count, 10);

    let after = tracker.track_event("api", "rate", None).await.unwrap();
    assert_eq!(after.outcome, Outcome::Deferred);
}

#[tokio::test]
async fn expired_identity_starts_over() {
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(
        TrackerConfig {
            limit: 1,
            expire_time: 200,
            ..TrackerConfig::default()
        },
        Strategy::simple(),
        clock.clone(),
    );

    tracker.track_event("auth", "login_fail", None).await.unwrap();
    let deferred = tracker.track_event("auth", "login_fail", None).await.unwrap();
    assert_eq!(deferred.outcome, Outcome::Deferred);

    clock.advance(201);
    let fresh = tracker.track_event("auth", "login_fail", None).await.unwrap();
    assert_eq!(fresh.outcome, Outcome::Immediate);
    assert_eq!(fresh.record.unwrap().count, 1);
}

#[tokio::test]
async fn cyclic_free_payloads_never_fail_hashing() {
    // Null details hash to the empty string and still produce a valid record.
    let clock = Arc::new(MockClock::new(0));
    let tracker = tracker(TrackerConfig::default(), Strategy::simple(), clock.clone());

    let tracked = tracker.track_event("auth", "login_fail", None).await.unwrap();
    let record = tracked.record.unwrap();
    assert_eq!(record.details_hash, "");
    assert_eq!(record.count, 1);
}

#[tokio::test]
async fn helpers_expose_identity_computation() {
    let key = EventTracker::<MemoryAdapter>::generate_composite_key("auth", "login_fail").unwrap();
    assert_eq!(key.len(), 64);

    let hash = EventTracker::<MemoryAdapter>::generate_details_hash(&json!({"a": 1}));
    assert_eq!(hash.len(), 64);
    assert_eq!(
        EventTracker::<MemoryAdapter>::generate_details_hash(&serde_json::Value::Null),
        ""
    );

    assert!(EventTracker::<MemoryAdapter>::generate_composite_key("", "x").is_err());
}
