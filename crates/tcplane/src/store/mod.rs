//! Event store contract.
//!
//! The store is the authoritative state of the control plane: an
//! append-only, per-aggregate log with optimistic concurrency. Two
//! implementations satisfy the contract interchangeably: the bundled
//! in-memory map ([`InMemoryEventStore`]) and any durable backend that
//! persists `(aggregate_id, event_type, payload, event_version,
//! occurred_at)` rows with a unique index on `(aggregate_id,
//! event_version)`; that index is what makes the concurrency check
//! correct under concurrent writers.

mod memory;

pub use memory::InMemoryEventStore;

use async_trait::async_trait;

use crate::domain::{Event, EventRecord};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures from the event store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The expected version did not match the log; another writer won.
    #[error(
        "concurrency conflict on {aggregate_id}: expected version {expected}, store has {actual}"
    )]
    ConcurrencyConflict {
        /// The contended aggregate.
        aggregate_id: String,
        /// The version the writer expected.
        expected: u64,
        /// The version the store holds.
        actual: u64,
    },

    /// The backend failed to read or write.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for crate::error::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            },
            StoreError::Storage(msg) => Self::Storage(msg),
        }
    }
}

/// Append-only event log with optimistic concurrency.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append `events` to an aggregate's log.
    ///
    /// Succeeds only when the aggregate's current highest `event_version`
    /// equals `expected_version`; the events receive consecutive versions
    /// starting at `expected_version + 1` and a commit timestamp. Returns
    /// the stored records for publication.
    async fn save(
        &self,
        aggregate_id: &str,
        events: Vec<Event>,
        expected_version: u64,
    ) -> StoreResult<Vec<EventRecord>>;

    /// All events for an aggregate in `event_version` order.
    async fn load(&self, aggregate_id: &str) -> StoreResult<Vec<EventRecord>>;

    /// Events for an aggregate with `event_version > from_version`.
    async fn load_from(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> StoreResult<Vec<EventRecord>>;

    /// Every event across aggregates, ordered by `(occurred_at,
    /// event_version)`. Coarse; meant for projection rebuilds only.
    async fn load_all(&self) -> StoreResult<Vec<EventRecord>>;
}
