//! Observability metrics for event tracking.
//!
//! Provides counters about tracking behavior for monitoring and debugging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking engine statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Events passed through immediately
    events_immediate: AtomicU64,
    /// Events that transitioned an identity into the deferred state
    events_deferred: AtomicU64,
    /// Events dropped (already deferred or key limit)
    events_ignored: AtomicU64,
    /// Deferred events released to the processor
    events_processed: AtomicU64,
    /// Batches lost after retry exhaustion
    process_failures: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_immediate(&self) {
        self.inner.events_immediate.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self) {
        self.inner.events_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self) {
        self.inner.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self, events: u64) {
        self.inner
            .events_processed
            .fetch_add(events, Ordering::Relaxed);
    }

    pub(crate) fn record_process_failure(&self) {
        self.inner.process_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Events passed through immediately.
    pub fn events_immediate(&self) -> u64 {
        self.inner.events_immediate.load(Ordering::Relaxed)
    }

    /// Events that transitioned an identity into the deferred state.
    pub fn events_deferred(&self) -> u64 {
        self.inner.events_deferred.load(Ordering::Relaxed)
    }

    /// Events dropped.
    pub fn events_ignored(&self) -> u64 {
        self.inner.events_ignored.load(Ordering::Relaxed)
    }

    /// Deferred events handed to the processor successfully.
    pub fn events_processed(&self) -> u64 {
        self.inner.events_processed.load(Ordering::Relaxed)
    }

    /// Batches lost after retry exhaustion.
    pub fn process_failures(&self) -> u64 {
        self.inner.process_failures.load(Ordering::Relaxed)
    }

    /// Get a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_immediate: self.events_immediate(),
            events_deferred: self.events_deferred(),
            events_ignored: self.events_ignored(),
            events_processed: self.events_processed(),
            process_failures: self.process_failures(),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_immediate: u64,
    pub events_deferred: u64,
    pub events_ignored: u64,
    pub events_processed: u64,
    pub process_failures: u64,
}

impl MetricsSnapshot {
    /// Total events that reached a tracking decision.
    pub fn total_events(&self) -> u64 {
        self.events_immediate
            .saturating_add(self.events_deferred)
            .saturating_add(self.events_ignored)
    }
}
