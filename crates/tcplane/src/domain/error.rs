//! Error types for the TC domain model.

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

/// Errors raised by value-object parsing and aggregate invariants.
///
/// Every variant here is surfaced before any event is persisted, so
/// callers always observe domain errors as pre-commit failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Input does not match the expected shape.
    #[error("invalid {what}: {input:?}")]
    InvalidFormat {
        /// What was being parsed (e.g. "handle", "bandwidth").
        what: &'static str,
        /// The offending input.
        input: String,
    },

    /// Input parses but falls outside the permitted range.
    #[error("{what} out of range: {detail}")]
    OutOfRange {
        /// What was being validated.
        what: &'static str,
        /// Human-readable bound description.
        detail: String,
    },

    /// A class or filter references a parent that does not exist.
    #[error("unknown parent {parent} on {device}")]
    UnknownParent {
        /// The device the reference was made on.
        device: String,
        /// The missing parent handle, formatted.
        parent: String,
    },

    /// A handle is already taken within its namespace on the device.
    #[error("handle {handle} already in use on {device}")]
    HandleConflict {
        /// The device the collision occurred on.
        device: String,
        /// The colliding handle, formatted.
        handle: String,
    },

    /// A tree invariant would be broken by the operation.
    #[error("invariant {name} violated: {detail}")]
    InvariantViolated {
        /// Stable invariant name (e.g. "single-root-qdisc").
        name: &'static str,
        /// Human-readable explanation.
        detail: String,
    },

    /// A declarative policy value was rejected during validation.
    #[error("{field} rejected: {reason}")]
    ValueRejected {
        /// The policy field that failed (e.g. "rate", "priority").
        field: &'static str,
        /// Why it failed.
        reason: String,
    },
}

impl DomainError {
    /// Shorthand for a [`DomainError::ValueRejected`].
    pub fn rejected(field: &'static str, reason: impl Into<String>) -> Self {
        Self::ValueRejected {
            field,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DomainError::InvariantViolated`].
    pub fn invariant(name: &'static str, detail: impl Into<String>) -> Self {
        Self::InvariantViolated {
            name,
            detail: detail.into(),
        }
    }
}
