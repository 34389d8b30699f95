//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::record::{EventRecord, NewEvent, RecordConfig};
use crate::domain::strategy::{IgnoreReason, Outcome, Strategy};
use async_trait::async_trait;
use std::fmt::{self, Debug};

/// Error surfaced by a storage adapter.
#[derive(Debug)]
pub enum StorageError {
    /// The backing store failed during the named operation.
    Backend { op: &'static str, message: String },
    /// An optimistic update kept losing the race for the watched key.
    ConflictRetriesExhausted { key: String, attempts: u32 },
}

impl StorageError {
    /// Wrap a backend failure with the operation that hit it.
    pub fn backend(op: &'static str, error: impl fmt::Display) -> Self {
        StorageError::Backend {
            op,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Backend { op, message } => {
                write!(f, "storage {op} failed: {message}")
            }
            StorageError::ConflictRetriesExhausted { key, attempts } => {
                write!(
                    f,
                    "update of {key} aborted by concurrent writes after {attempts} attempts"
                )
            }
        }
    }
}

impl std::error::Error for StorageError {}

/// Result of the adapter's atomic `track` operation.
#[derive(Debug, Clone)]
pub struct TrackResult {
    pub outcome: Outcome,
    /// Present iff `outcome` is `Ignored`.
    pub reason: Option<IgnoreReason>,
    /// The stored record; `None` when the key limit rejected a new identity.
    pub record: Option<EventRecord>,
}

/// Port for obtaining current wall-clock time.
///
/// Deferred releases are scored in epoch milliseconds and shared through the
/// backing store, so this must be wall time rather than a monotonic instant.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Port for per-identity record storage.
///
/// All mutating operations must be atomic per identity: for one key, the
/// load/decide/write sequence inside `track` is never interleaved with another
/// operation on the same key, whether the backing store is in-process memory
/// or a shared Redis instance. Records crossing this boundary are owned
/// values; callers can never mutate stored state through them.
#[async_trait]
pub trait StorageAdapter: Send + Sync + Debug {
    /// Fetch one record.
    async fn get(&self, key: &str) -> Result<Option<EventRecord>, StorageError>;

    /// Upsert one record, maintaining the deferred index.
    async fn set(&self, key: &str, record: EventRecord) -> Result<(), StorageError>;

    /// Remove a record and its deferred-index entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Atomically apply `apply` to an existing record.
    ///
    /// Returns the updated record, or `None` if the identity is absent. The
    /// deferred-index invariant is preserved across the write.
    async fn update(
        &self,
        key: &str,
        apply: &(dyn Fn(EventRecord) -> EventRecord + Send + Sync),
    ) -> Result<Option<EventRecord>, StorageError>;

    /// Number of live records.
    async fn size(&self) -> Result<usize, StorageError>;

    /// Whether `key` could be admitted: true iff it already exists or a new
    /// slot is available under `max_keys` (0 meaning unlimited).
    ///
    /// Advisory for the in-process adapter; the authoritative decision is
    /// re-made atomically inside `track`.
    async fn acquire_key_slot(&self, key: &str, max_keys: usize) -> Result<bool, StorageError>;

    /// Atomic compound operation: load the prior record, apply the freshness
    /// rule (expired or payload-changed records count as absent), enforce
    /// `max_keys`, run the strategy decision, write the result, and maintain
    /// the deferred index.
    async fn track(
        &self,
        key: &str,
        event: NewEvent,
        defaults: &RecordConfig,
        max_keys: usize,
        strategy: &Strategy,
    ) -> Result<TrackResult, StorageError>;

    /// Non-destructive scan of deferred records with `scheduled_send_at <= now_ms`.
    async fn find_due_deferred(&self, now_ms: u64) -> Result<Vec<EventRecord>, StorageError>;

    /// Atomically remove and return all due deferred records.
    async fn pop_due_deferred(&self, now_ms: u64) -> Result<Vec<EventRecord>, StorageError>;

    /// Snapshot of all deferred records regardless of schedule.
    async fn find_all_deferred(&self) -> Result<Vec<EventRecord>, StorageError>;

    /// Release adapter-owned resources (background loops). Adapters that
    /// borrow an external connection must not close it here.
    async fn destroy(&self) -> Result<(), StorageError>;
}

/// Error type for user-supplied processors.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

/// Port for the user-supplied batch consumer of due deferred events.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Handle one batch of released events.
    ///
    /// A returned error triggers the engine's bounded retry; the batch has
    /// already been removed from storage either way.
    async fn process(&self, events: Vec<EventRecord>) -> Result<(), ProcessorError>;
}

/// Adapter allowing a plain async closure to serve as an `EventProcessor`.
pub struct FnProcessor<F>(pub F);

#[async_trait]
impl<F, Fut> EventProcessor for FnProcessor<F>
where
    F: Fn(Vec<EventRecord>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ProcessorError>> + Send + 'static,
{
    async fn process(&self, events: Vec<EventRecord>) -> Result<(), ProcessorError> {
        (self.0)(events).await
    }
}
