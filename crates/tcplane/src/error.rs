//! Crate-level error type.

use crate::adapter::AdapterError;
use crate::domain::DomainError;

/// Result type for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the command, query and apply pipelines.
///
/// Domain errors are always pre-commit: the aggregate and builder reject
/// before anything is persisted. After a commit only store, adapter or
/// subscriber failures can occur, and the event log stays authoritative.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A value-object or aggregate rejection.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Another writer committed to the aggregate first.
    #[error(
        "concurrency conflict on {aggregate_id}: expected version {expected}, store has {actual}"
    )]
    ConcurrencyConflict {
        /// The contended aggregate.
        aggregate_id: String,
        /// The version the writer based its work on.
        expected: u64,
        /// The version the store holds.
        actual: u64,
    },

    /// The event store failed to read or write.
    #[error("storage error: {0}")]
    Storage(String),

    /// The netlink adapter rejected or failed an operation.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// The operation's context was cancelled or timed out.
    #[error("operation cancelled")]
    Cancelled,

    /// A command kind with no registered handler.
    #[error("no handler registered for command {0:?}")]
    UnknownCommand(String),
}

impl Error {
    /// True when the failure is a retryable optimistic-concurrency loss.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
