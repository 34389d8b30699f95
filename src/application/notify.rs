//! Lifecycle notifications.
//!
//! The engine publishes one notification per tracked event and per
//! processing-loop transition over a broadcast channel. Subscribers that lag
//! behind drop old notifications rather than ever blocking the hot path.

use crate::domain::record::EventRecord;
use crate::domain::strategy::IgnoreReason;
use serde_json::Value;

/// Capacity of the notification channel per subscriber.
pub(crate) const NOTIFICATION_CAPACITY: usize = 256;

/// Payload published when an event is ignored.
///
/// The shape is uniform regardless of cause: the original identifiers and
/// payload plus the reason, whether the identity was already deferred or the
/// key limit rejected it.
#[derive(Debug, Clone)]
pub struct IgnoredEvent {
    pub reason: IgnoreReason,
    pub category: String,
    pub id: String,
    pub details: Value,
}

/// A lifecycle notification published by the engine.
#[derive(Debug, Clone)]
pub enum TrackerNotification {
    /// An event passed through immediately
    Immediate(EventRecord),
    /// An event transitioned its identity into the deferred state
    Deferred(EventRecord),
    /// An event was dropped
    Ignored(IgnoredEvent),
    /// A deferred event was released to the processor (one per event)
    Processed(EventRecord),
    /// A processor failure is about to be retried after a backoff sleep
    Retry {
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        events: Vec<EventRecord>,
    },
    /// The processor failed on a batch after all retries
    ProcessFailed {
        error: String,
        events: Vec<EventRecord>,
        attempts: u32,
    },
    /// An identity's config snapshot was rewritten
    ConfigUpdated(EventRecord),
    /// An operational error surfaced through the notification stream
    Error(String),
}

impl TrackerNotification {
    /// Stable name of the notification kind.
    pub fn name(&self) -> &'static str {
        match self {
            TrackerNotification::Immediate(_) => "immediate",
            TrackerNotification::Deferred(_) => "deferred",
            TrackerNotification::Ignored(_) => "ignored",
            TrackerNotification::Processed(_) => "processed",
            TrackerNotification::Retry { .. } => "retry",
            TrackerNotification::ProcessFailed { .. } => "process_failed",
            TrackerNotification::ConfigUpdated(_) => "config_updated",
            TrackerNotification::Error(_) => "error",
        }
    }
}
