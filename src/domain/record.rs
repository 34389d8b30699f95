//! The per-identity event record.
//!
//! One `EventRecord` exists per live event stream. It carries the absorbed
//! event count, the expiry and defer schedule, a snapshot of the tuning
//! parameters that applied when the record was created, and whatever
//! auxiliary state the owning strategy needs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Snapshot of the tuning parameters bound to one record.
///
/// The snapshot is captured when the record is created and travels with it,
/// so runtime configuration changes alter behavior only for identities that
/// are explicitly re-targeted via `update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Event count threshold (simple counter, sliding window)
    pub limit: u64,
    /// How far in the future a deferred release is scheduled, in ms
    pub defer_interval: u64,
    /// Idle lifetime of the record, in ms
    pub expire_time: u64,
    /// Token bucket capacity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<f64>,
    /// Token bucket refill rate, tokens per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate: Option<f64>,
    /// Sliding window length, in ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<u64>,
}

impl RecordConfig {
    /// Merge a patch into this snapshot.
    ///
    /// Only fields the patch actually sets are applied; an explicit zero is a
    /// legitimate value and `None` is the only "unset" marker.
    pub fn merge(&mut self, patch: &ConfigPatch) {
        if let Some(limit) = patch.limit {
            self.limit = limit;
        }
        if let Some(defer_interval) = patch.defer_interval {
            self.defer_interval = defer_interval;
        }
        if let Some(expire_time) = patch.expire_time {
            self.expire_time = expire_time;
        }
        if let Some(bucket_size) = patch.bucket_size {
            self.bucket_size = Some(bucket_size);
        }
        if let Some(refill_rate) = patch.refill_rate {
            self.refill_rate = Some(refill_rate);
        }
        if let Some(window_size) = patch.window_size {
            self.window_size = Some(window_size);
        }
    }
}

/// Partial update applied to one identity's config snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub limit: Option<u64>,
    pub defer_interval: Option<u64>,
    pub expire_time: Option<u64>,
    pub bucket_size: Option<f64>,
    pub refill_rate: Option<f64>,
    pub window_size: Option<u64>,
}

/// Strategy-private auxiliary state.
///
/// Each record is bound to exactly one strategy type; the serde tag keeps the
/// variants from leaking across strategies when records round-trip through a
/// backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StrategyData {
    /// The simple counter keeps no auxiliary state.
    #[default]
    None,
    /// Token bucket fill level and last refill time.
    TokenBucket { tokens: f64, last_refill: u64 },
    /// Sliding window counters and the start of the current window.
    SlidingWindow {
        current_count: u64,
        previous_count: u64,
        window_start: u64,
    },
}

/// State tracked for one event identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Composite key identifying the stream
    pub key: String,
    /// Original category, retained for observability
    pub category: String,
    /// Original id, retained for observability
    pub id: String,
    /// Opaque user payload
    pub details: Value,
    /// Fingerprint of the current payload
    pub details_hash: String,
    /// Total events absorbed into this record's window
    pub count: u64,
    /// Milliseconds since epoch of the last accepted event
    pub last_event_time: u64,
    /// Milliseconds since epoch; the record is dead once `now > expires_at`
    pub expires_at: u64,
    /// True iff further events are currently held back
    pub deferred: bool,
    /// Scheduled release time; only meaningful while `deferred`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_send_at: Option<u64>,
    /// Tuning snapshot captured at creation
    pub config: RecordConfig,
    /// Opaque to everything but the strategy that wrote it
    #[serde(default)]
    pub strategy_data: StrategyData,
}

impl EventRecord {
    /// Whether the record has outlived its expiry.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }

    /// Whether a deferred record has come due.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.deferred
            && self
                .scheduled_send_at
                .is_some_and(|scheduled| scheduled <= now_ms)
    }
}

/// An incoming event, validated and fingerprinted by the engine.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub category: String,
    pub id: String,
    pub details: Value,
    pub details_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> RecordConfig {
        RecordConfig {
            limit: 5,
            defer_interval: 3_600_000,
            expire_time: 86_400_000,
            bucket_size: None,
            refill_rate: None,
            window_size: None,
        }
    }

    #[test]
    fn merge_applies_only_set_fields() {
        let mut snapshot = config();
        snapshot.merge(&ConfigPatch {
            limit: Some(0),
            ..ConfigPatch::default()
        });

        // A legitimate zero survives the merge; untouched fields keep their values.
        assert_eq!(snapshot.limit, 0);
        assert_eq!(snapshot.defer_interval, 3_600_000);
        assert_eq!(snapshot.expire_time, 86_400_000);
    }

    #[test]
    fn merge_sets_strategy_fields() {
        let mut snapshot = config();
        snapshot.merge(&ConfigPatch {
            bucket_size: Some(10.0),
            refill_rate: Some(2.5),
            window_size: Some(1_000),
            ..ConfigPatch::default()
        });

        assert_eq!(snapshot.bucket_size, Some(10.0));
        assert_eq!(snapshot.refill_rate, Some(2.5));
        assert_eq!(snapshot.window_size, Some(1_000));
    }

    #[test]
    fn expiry_and_due_checks() {
        let record = EventRecord {
            key: "k".into(),
            category: "auth".into(),
            id: "login_fail".into(),
            details: json!({"ip": "1.1.1.1"}),
            details_hash: "abc".into(),
            count: 3,
            last_event_time: 1_000,
            expires_at: 2_000,
            deferred: true,
            scheduled_send_at: Some(1_500),
            config: config(),
            strategy_data: StrategyData::None,
        };

        assert!(!record.is_expired(2_000));
        assert!(record.is_expired(2_001));
        assert!(!record.is_due(1_499));
        assert!(record.is_due(1_500));
    }

    #[test]
    fn non_deferred_record_is_never_due() {
        let mut record = EventRecord {
            key: "k".into(),
            category: "c".into(),
            id: "i".into(),
            details: Value::Null,
            details_hash: String::new(),
            count: 1,
            last_event_time: 0,
            expires_at: 10,
            deferred: false,
            scheduled_send_at: None,
            config: config(),
            strategy_data: StrategyData::None,
        };
        assert!(!record.is_due(u64::MAX));

        record.scheduled_send_at = Some(0);
        assert!(!record.is_due(u64::MAX));
    }

    #[test]
    fn strategy_data_round_trips_with_type_tag() {
        let data = StrategyData::TokenBucket {
            tokens: 3.25,
            last_refill: 42,
        };
        let encoded = serde_json::to_string(&data).unwrap();
        assert!(encoded.contains("\"type\":\"token-bucket\""));

        let decoded: StrategyData = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = EventRecord {
            key: "k".into(),
            category: "auth".into(),
            id: "login_fail".into(),
            details: json!({"ip": "1.1.1.1"}),
            details_hash: "abc".into(),
            count: 2,
            last_event_time: 100,
            expires_at: 200,
            deferred: false,
            scheduled_send_at: None,
            config: config(),
            strategy_data: StrategyData::SlidingWindow {
                current_count: 2,
                previous_count: 0,
                window_start: 50,
            },
        };

        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: EventRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
