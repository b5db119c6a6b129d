//! Network device name value object.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::DomainError;

/// Maximum interface name length, excluding the null terminator (IFNAMSIZ - 1).
pub const MAX_DEVICE_NAME_LEN: usize = 15;

/// A validated Linux network interface name.
///
/// Follows the kernel naming convention: 1 to 15 characters drawn from
/// letters, digits, `_`, `.`, `-` and `@`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceName(String);

impl DeviceName {
    /// Validate and wrap an interface name.
    pub fn parse(name: &str) -> Result<Self, DomainError> {
        if name.is_empty() {
            return Err(DomainError::InvalidFormat {
                what: "device name",
                input: name.to_string(),
            });
        }
        if name.len() > MAX_DEVICE_NAME_LEN {
            return Err(DomainError::OutOfRange {
                what: "device name",
                detail: format!("{name:?} exceeds {MAX_DEVICE_NAME_LEN} characters"),
            });
        }
        let ok = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'));
        if !ok {
            return Err(DomainError::InvalidFormat {
                what: "device name",
                input: name.to_string(),
            });
        }
        Ok(Self(name.to_string()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for DeviceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for DeviceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DeviceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
