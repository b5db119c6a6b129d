//! Class and filter priority value objects.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// A traffic-class priority, 0 (highest) through 7 (lowest).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Highest priority.
    pub const HIGHEST: Self = Self(0);
    /// Lowest priority.
    pub const LOWEST: Self = Self(7);

    /// Validate and wrap a priority value.
    pub fn new(value: u8) -> Result<Self, DomainError> {
        if value > 7 {
            return Err(DomainError::OutOfRange {
                what: "priority",
                detail: format!("{value} not in 0..=7"),
            });
        }
        Ok(Self(value))
    }

    /// The raw value.
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A filter priority. Non-zero; lower values match first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FilterPriority(u16);

impl FilterPriority {
    /// Validate and wrap a filter priority.
    pub fn new(value: u16) -> Result<Self, DomainError> {
        if value == 0 {
            return Err(DomainError::OutOfRange {
                what: "filter priority",
                detail: "must be non-zero".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// The raw value.
    pub const fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for FilterPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
