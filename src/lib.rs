//! # event-tracker
//!
//! Event aggregation and throttling engine.
//!
//! The engine accepts a high-velocity stream of `(category, id, details)`
//! events and, per distinct identity, decides one of three outcomes: pass the
//! event through **immediately**, **defer** it for later batch processing, or
//! **ignore** it. Deferred identities are persisted with a scheduled release
//! time; a background loop harvests due events and hands them to a
//! user-supplied processor in batches, with bounded exponential-backoff retry.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use event_tracker::{EventTracker, FnProcessor, Strategy, TrackerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tracker = EventTracker::new(
//!         TrackerConfig {
//!             limit: 3,
//!             defer_interval: 60_000,
//!             ..TrackerConfig::default()
//!         },
//!         Strategy::simple(),
//!     )?;
//!
//!     tracker
//!         .set_processor(FnProcessor(|events: Vec<event_tracker::EventRecord>| async move {
//!             for event in &events {
//!                 println!("released {}:{} x{}", event.category, event.id, event.count);
//!             }
//!             Ok(())
//!         }))
//!         .await;
//!
//!     tracker
//!         .track_event("auth", "login_fail", Some(json!({"ip": "1.1.1.1"})))
//!         .await?;
//!
//!     tracker.destroy().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Pluggable strategies**: simple counter, token bucket, sliding weighted
//!   window — or the same decision replayed server-side in Redis
//! - **Per-identity throttling**: distinct `(category, id)` streams are
//!   throttled independently; a changed payload resets the stream
//! - **Atomic state**: per-key mutexes in process, server-side scripts in
//!   Redis, so concurrent events for one identity never race
//! - **Deferred batch processing**: a time-ordered index drives a polling
//!   loop with bounded retry and lifecycle notifications
//! - **Key limits and expiry**: `max_keys` bounds live identities; expired
//!   records are swept in process or reaped by per-key TTL in Redis

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    identity::{composite_key, details_hash, IdentityError},
    record::{ConfigPatch, EventRecord, NewEvent, RecordConfig, StrategyData},
    strategy::{
        IgnoreReason, Outcome, SimpleStrategy, SlidingWindowStrategy, Strategy,
        StrategyConfigError, StrategyDecision, StrategyKind, ThrottleStrategy,
        TokenBucketStrategy,
    },
};

pub use application::{
    config::{ConfigError, TrackerConfig, MIN_PROCESSING_INTERVAL_MS},
    metrics::{Metrics, MetricsSnapshot},
    notify::{IgnoredEvent, TrackerNotification},
    ports::{
        Clock, EventProcessor, FnProcessor, ProcessorError, StorageAdapter, StorageError,
        TrackResult,
    },
    tracker::{EventTracker, TrackedEvent, TrackerError},
};

pub use infrastructure::{clock::SystemClock, memory::MemoryAdapter};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis::{RedisAdapter, RedisAdapterConfig};
