//! Throttling strategies.
//!
//! A strategy looks at the prior record for an identity (if any) and the
//! incoming event, and produces the next record plus an outcome: pass the
//! event through immediately, defer it for batch processing, or ignore it.
//!
//! Strategies are dispatched by a string type tag rather than by runtime
//! type identity, so a distributed backend can replay the same decision
//! inside a server-side script. Adding a strategy means touching both the
//! client implementation here and the script arm in the Redis adapter.

use crate::domain::record::{EventRecord, NewEvent, RecordConfig, StrategyData};
use std::fmt;

/// Outcome of a throttling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Pass the event through to the caller now
    Immediate,
    /// Hold the event back with a scheduled release time
    Deferred,
    /// Drop the event (it may still refresh the record's expiry)
    Ignored,
}

impl Outcome {
    /// Wire tag used in notifications and the distributed backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Immediate => "immediate",
            Outcome::Deferred => "deferred",
            Outcome::Ignored => "ignored",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an event was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The identity is already deferred; the event only refreshed its expiry
    AlreadyDeferred,
    /// A new identity could not be admitted because `max_keys` is exhausted
    KeyLimitReached,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::AlreadyDeferred => "already_deferred",
            IgnoreReason::KeyLimitReached => "key_limit_reached",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy type tag, stable across the network boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Simple,
    TokenBucket,
    SlidingWindow,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Simple => "simple",
            StrategyKind::TokenBucket => "token-bucket",
            StrategyKind::SlidingWindow => "sliding-window",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when strategy parameters fail validation.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyConfigError {
    /// Bucket size must be finite and greater than zero
    InvalidBucketSize(f64),
    /// Refill rate must be finite and greater than zero
    InvalidRefillRate(f64),
    /// Window size must be greater than zero
    ZeroWindowSize,
}

impl fmt::Display for StrategyConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyConfigError::InvalidBucketSize(v) => {
                write!(f, "bucket size must be a positive finite number, got {v}")
            }
            StrategyConfigError::InvalidRefillRate(v) => {
                write!(f, "refill rate must be a positive finite number, got {v}")
            }
            StrategyConfigError::ZeroWindowSize => {
                write!(f, "window size must be greater than zero")
            }
        }
    }
}

impl std::error::Error for StrategyConfigError {}

/// Result of a strategy decision: the outcome and the record to store.
#[derive(Debug, Clone)]
pub struct StrategyDecision {
    pub outcome: Outcome,
    pub record: EventRecord,
}

/// Trait for throttling strategies.
///
/// `decide` is pure: given the prior record (already freshness-checked by the
/// adapter, so a stale or payload-changed record arrives as `None`) and the
/// incoming event, return the next record and an outcome. Tracker-level
/// defaults arrive via `defaults`; existing records use the config snapshot
/// they carry instead.
pub trait ThrottleStrategy: Send + Sync {
    /// The serialization type tag.
    fn kind(&self) -> StrategyKind;

    /// Resolve the tuning snapshot captured into records this strategy creates.
    fn base_config(&self, defaults: &RecordConfig) -> RecordConfig;

    /// Register an event and decide its outcome.
    fn decide(
        &self,
        key: &str,
        prior: Option<&EventRecord>,
        event: &NewEvent,
        now_ms: u64,
        defaults: &RecordConfig,
    ) -> StrategyDecision;
}

/// Build the record for the first event of a fresh identity.
fn fresh_record(
    key: &str,
    event: &NewEvent,
    now_ms: u64,
    config: RecordConfig,
    strategy_data: StrategyData,
) -> EventRecord {
    let expires_at = now_ms + config.expire_time;
    EventRecord {
        key: key.to_string(),
        category: event.category.clone(),
        id: event.id.clone(),
        details: event.details.clone(),
        details_hash: event.details_hash.clone(),
        count: 1,
        last_event_time: now_ms,
        expires_at,
        deferred: false,
        scheduled_send_at: None,
        config,
        strategy_data,
    }
}

/// Simple counter: absorb up to `limit` events, then defer.
///
/// Once deferred, further events are ignored (refreshing only the expiry)
/// until the record is popped by the processing loop or expires.
#[derive(Debug, Clone, Default)]
pub struct SimpleStrategy {
    limit: Option<u64>,
    defer_interval: Option<u64>,
}

impl SimpleStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the tracker-level event limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Override the tracker-level defer interval.
    pub fn with_defer_interval(mut self, defer_interval_ms: u64) -> Self {
        self.defer_interval = Some(defer_interval_ms);
        self
    }
}

impl ThrottleStrategy for SimpleStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Simple
    }

    fn base_config(&self, defaults: &RecordConfig) -> RecordConfig {
        RecordConfig {
            limit: self.limit.unwrap_or(defaults.limit),
            defer_interval: self.defer_interval.unwrap_or(defaults.defer_interval),
            ..defaults.clone()
        }
    }

    fn decide(
        &self,
        key: &str,
        prior: Option<&EventRecord>,
        event: &NewEvent,
        now_ms: u64,
        defaults: &RecordConfig,
    ) -> StrategyDecision {
        let Some(prior) = prior else {
            let config = self.base_config(defaults);
            let mut record = fresh_record(key, event, now_ms, config, StrategyData::None);
            if record.count > record.config.limit {
                record.deferred = true;
                record.scheduled_send_at = Some(now_ms + record.config.defer_interval);
                return StrategyDecision {
                    outcome: Outcome::Deferred,
                    record,
                };
            }
            return StrategyDecision {
                outcome: Outcome::Immediate,
                record,
            };
        };

        let mut record = prior.clone();
        record.expires_at = now_ms + record.config.expire_time;

        if prior.deferred {
            // Count and last_event_time stay untouched while deferred.
            return StrategyDecision {
                outcome: Outcome::Ignored,
                record,
            };
        }

        record.count += 1;
        record.last_event_time = now_ms;

        if record.count > record.config.limit {
            record.deferred = true;
            record.scheduled_send_at = Some(now_ms + record.config.defer_interval);
            StrategyDecision {
                outcome: Outcome::Deferred,
                record,
            }
        } else {
            StrategyDecision {
                outcome: Outcome::Immediate,
                record,
            }
        }
    }
}

/// Token bucket: a burst allowance that refills continuously over time.
///
/// Refill is time-driven, so a sub-token state is re-evaluated on every
/// event: a successful event clears any previously deferred state, and an
/// unsuccessful one re-schedules the release rather than being ignored.
#[derive(Debug, Clone)]
pub struct TokenBucketStrategy {
    bucket_size: f64,
    refill_rate: f64,
    defer_interval: Option<u64>,
}

impl TokenBucketStrategy {
    /// Create a token bucket with the given capacity and refill rate
    /// (tokens per second).
    ///
    /// # Errors
    /// Returns an error unless both parameters are finite and positive.
    pub fn new(bucket_size: f64, refill_rate: f64) -> Result<Self, StrategyConfigError> {
        if !bucket_size.is_finite() || bucket_size <= 0.0 {
            return Err(StrategyConfigError::InvalidBucketSize(bucket_size));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(StrategyConfigError::InvalidRefillRate(refill_rate));
        }
        Ok(Self {
            bucket_size,
            refill_rate,
            defer_interval: None,
        })
    }

    /// Override the tracker-level defer interval.
    pub fn with_defer_interval(mut self, defer_interval_ms: u64) -> Self {
        self.defer_interval = Some(defer_interval_ms);
        self
    }
}

impl ThrottleStrategy for TokenBucketStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TokenBucket
    }

    fn base_config(&self, defaults: &RecordConfig) -> RecordConfig {
        RecordConfig {
            defer_interval: self.defer_interval.unwrap_or(defaults.defer_interval),
            bucket_size: Some(self.bucket_size),
            refill_rate: Some(self.refill_rate),
            ..defaults.clone()
        }
    }

    fn decide(
        &self,
        key: &str,
        prior: Option<&EventRecord>,
        event: &NewEvent,
        now_ms: u64,
        defaults: &RecordConfig,
    ) -> StrategyDecision {
        let Some(prior) = prior else {
            let config = self.base_config(defaults);
            let tokens = config.bucket_size.unwrap_or(self.bucket_size) - 1.0;
            let record = fresh_record(
                key,
                event,
                now_ms,
                config,
                StrategyData::TokenBucket {
                    tokens,
                    last_refill: now_ms,
                },
            );
            return StrategyDecision {
                outcome: Outcome::Immediate,
                record,
            };
        };

        let mut record = prior.clone();
        let bucket_size = record.config.bucket_size.unwrap_or(self.bucket_size);
        let refill_rate = record.config.refill_rate.unwrap_or(self.refill_rate);

        let (mut tokens, last_refill) = match prior.strategy_data {
            StrategyData::TokenBucket {
                tokens,
                last_refill,
            } => (tokens, last_refill),
            _ => (bucket_size, prior.last_event_time),
        };

        let elapsed_ms = now_ms.saturating_sub(last_refill);
        tokens = (tokens + elapsed_ms as f64 / 1000.0 * refill_rate).min(bucket_size);

        record.last_event_time = now_ms;
        record.expires_at = now_ms + record.config.expire_time;

        if tokens >= 1.0 {
            tokens -= 1.0;
            record.count += 1;
            record.deferred = false;
            record.scheduled_send_at = None;
            record.strategy_data = StrategyData::TokenBucket {
                tokens,
                last_refill: now_ms,
            };
            StrategyDecision {
                outcome: Outcome::Immediate,
                record,
            }
        } else {
            let retry_ms = (1.0 - tokens) * (1000.0 / refill_rate);
            let retry_ms = if retry_ms.is_finite() {
                (retry_ms.ceil() as u64).max(1)
            } else {
                record.config.defer_interval.max(1)
            };
            record.deferred = true;
            record.scheduled_send_at = Some(now_ms + retry_ms);
            record.strategy_data = StrategyData::TokenBucket {
                tokens,
                last_refill: now_ms,
            };
            StrategyDecision {
                outcome: Outcome::Deferred,
                record,
            }
        }
    }
}

/// Sliding weighted window: estimate the rate over the current and previous
/// window, weighting the previous one by how much of it still overlaps.
#[derive(Debug, Clone)]
pub struct SlidingWindowStrategy {
    limit: Option<u64>,
    window_size: u64,
    defer_interval: Option<u64>,
}

impl SlidingWindowStrategy {
    /// Create a sliding window of the given length in milliseconds.
    ///
    /// # Errors
    /// Returns an error if the window size is zero.
    pub fn new(window_size_ms: u64) -> Result<Self, StrategyConfigError> {
        if window_size_ms == 0 {
            return Err(StrategyConfigError::ZeroWindowSize);
        }
        Ok(Self {
            limit: None,
            window_size: window_size_ms,
            defer_interval: None,
        })
    }

    /// Override the tracker-level event limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Override the tracker-level defer interval.
    pub fn with_defer_interval(mut self, defer_interval_ms: u64) -> Self {
        self.defer_interval = Some(defer_interval_ms);
        self
    }
}

impl ThrottleStrategy for SlidingWindowStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindow
    }

    fn base_config(&self, defaults: &RecordConfig) -> RecordConfig {
        RecordConfig {
            limit: self.limit.unwrap_or(defaults.limit),
            defer_interval: self.defer_interval.unwrap_or(defaults.defer_interval),
            window_size: Some(self.window_size),
            ..defaults.clone()
        }
    }

    fn decide(
        &self,
        key: &str,
        prior: Option<&EventRecord>,
        event: &NewEvent,
        now_ms: u64,
        defaults: &RecordConfig,
    ) -> StrategyDecision {
        let Some(prior) = prior else {
            let config = self.base_config(defaults);
            let record = fresh_record(
                key,
                event,
                now_ms,
                config,
                StrategyData::SlidingWindow {
                    current_count: 1,
                    previous_count: 0,
                    window_start: now_ms,
                },
            );
            return StrategyDecision {
                outcome: Outcome::Immediate,
                record,
            };
        };

        let mut record = prior.clone();
        let window = record.config.window_size.unwrap_or(self.window_size).max(1);
        let limit = record.config.limit;

        let (mut current, mut previous, mut start) = match prior.strategy_data {
            StrategyData::SlidingWindow {
                current_count,
                previous_count,
                window_start,
            } => (current_count, previous_count, window_start),
            _ => (prior.count, 0, prior.last_event_time),
        };

        let elapsed = now_ms.saturating_sub(start);
        if elapsed >= window {
            // The previous window is stale once two full windows have passed.
            previous = if elapsed >= 2 * window { 0 } else { current };
            current = 0;
            start = now_ms - (elapsed % window);
        }

        let in_window = now_ms.saturating_sub(start);
        let weight = (window - in_window) as f64 / window as f64;
        let estimated = current as f64 + previous as f64 * weight;

        record.expires_at = now_ms + record.config.expire_time;

        if estimated < limit as f64 {
            current += 1;
            record.count = (estimated + 1.0).floor() as u64;
            record.last_event_time = now_ms;
            record.deferred = false;
            record.scheduled_send_at = None;
            record.strategy_data = StrategyData::SlidingWindow {
                current_count: current,
                previous_count: previous,
                window_start: start,
            };
            StrategyDecision {
                outcome: Outcome::Immediate,
                record,
            }
        } else if prior.deferred {
            // Over the limit and already held back: only the expiry moves.
            record.strategy_data = StrategyData::SlidingWindow {
                current_count: current,
                previous_count: previous,
                window_start: start,
            };
            StrategyDecision {
                outcome: Outcome::Ignored,
                record,
            }
        } else {
            record.deferred = true;
            record.scheduled_send_at = Some(now_ms + record.config.defer_interval);
            record.last_event_time = now_ms;
            record.strategy_data = StrategyData::SlidingWindow {
                current_count: current,
                previous_count: previous,
                window_start: start,
            };
            StrategyDecision {
                outcome: Outcome::Deferred,
                record,
            }
        }
    }
}

/// Convenience enum over the built-in strategies.
#[derive(Debug, Clone)]
pub enum Strategy {
    Simple(SimpleStrategy),
    TokenBucket(TokenBucketStrategy),
    SlidingWindow(SlidingWindowStrategy),
}

impl Strategy {
    /// Simple counter with tracker-level defaults.
    pub fn simple() -> Self {
        Strategy::Simple(SimpleStrategy::new())
    }

    /// Token bucket with the given capacity and refill rate (tokens/second).
    pub fn token_bucket(bucket_size: f64, refill_rate: f64) -> Result<Self, StrategyConfigError> {
        Ok(Strategy::TokenBucket(TokenBucketStrategy::new(
            bucket_size,
            refill_rate,
        )?))
    }

    /// Sliding weighted window of the given length in milliseconds.
    pub fn sliding_window(window_size_ms: u64) -> Result<Self, StrategyConfigError> {
        Ok(Strategy::SlidingWindow(SlidingWindowStrategy::new(
            window_size_ms,
        )?))
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::simple()
    }
}

impl ThrottleStrategy for Strategy {
    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Simple(s) => s.kind(),
            Strategy::TokenBucket(s) => s.kind(),
            Strategy::SlidingWindow(s) => s.kind(),
        }
    }

    fn base_config(&self, defaults: &RecordConfig) -> RecordConfig {
        match self {
            Strategy::Simple(s) => s.base_config(defaults),
            Strategy::TokenBucket(s) => s.base_config(defaults),
            Strategy::SlidingWindow(s) => s.base_config(defaults),
        }
    }

    fn decide(
        &self,
        key: &str,
        prior: Option<&EventRecord>,
        event: &NewEvent,
        now_ms: u64,
        defaults: &RecordConfig,
    ) -> StrategyDecision {
        match self {
            Strategy::Simple(s) => s.decide(key, prior, event, now_ms, defaults),
            Strategy::TokenBucket(s) => s.decide(key, prior, event, now_ms, defaults),
            Strategy::SlidingWindow(s) => s.decide(key, prior, event, now_ms, defaults),
        }
    }
}
