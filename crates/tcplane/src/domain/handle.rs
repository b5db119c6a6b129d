//! TC handle value object.
//!
//! A handle is the `(major, minor)` pair identifying a qdisc or class
//! within a device's tree, written `"M:m"` in decimal. The kernel packs the
//! same pair into a `u32` as `(major << 16) | minor`; [`Handle::as_u32`]
//! and [`Handle::from_u32`] convert to and from that wire encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::DomainError;

/// A `(major, minor)` TC handle. Ordering is lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Handle {
    major: u16,
    minor: u16,
}

impl Handle {
    /// The conventional root qdisc handle, `1:0`.
    pub const ROOT: Self = Self { major: 1, minor: 0 };

    /// Construct from parts.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// The major component.
    pub const fn major(&self) -> u16 {
        self.major
    }

    /// The minor component.
    pub const fn minor(&self) -> u16 {
        self.minor
    }

    /// True for `M:0` handles, which name a qdisc rather than a class.
    pub const fn is_qdisc(&self) -> bool {
        self.minor == 0
    }

    /// Parse a decimal `"M:m"` handle.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::InvalidFormat {
            what: "handle",
            input: input.to_string(),
        };

        let s = input.trim();
        let (major, minor) = s.split_once(':').ok_or_else(invalid)?;
        if major.is_empty() || minor.is_empty() || minor.contains(':') {
            return Err(invalid());
        }
        if !major.chars().all(|c| c.is_ascii_digit())
            || !minor.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let out_of_range = |part: &str| DomainError::OutOfRange {
            what: "handle",
            detail: format!("component {part:?} exceeds 16 bits"),
        };
        let major = major.parse().map_err(|_| out_of_range(major))?;
        let minor = minor.parse().map_err(|_| out_of_range(minor))?;
        Ok(Self { major, minor })
    }

    /// The kernel's packed `u32` encoding.
    pub const fn as_u32(&self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }

    /// Unpack the kernel's `u32` encoding.
    pub const fn from_u32(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for Handle {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Events persist handles in their display form.
impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let h = Handle::parse("1:0").unwrap();
        assert_eq!(h, Handle::ROOT);
        assert_eq!(h.to_string(), "1:0");

        let h = Handle::parse("1:999").unwrap();
        assert_eq!((h.major(), h.minor()), (1, 999));
        assert_eq!(h.to_string(), "1:999");
    }

    #[test]
    fn test_parse_round_trip() {
        for (major, minor) in [(0, 0), (1, 0), (1, 14), (42, 65535), (65535, 1)] {
            let h = Handle::new(major, minor);
            assert_eq!(Handle::parse(&h.to_string()).unwrap(), h);
        }
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        for input in ["", "1", ":", "1:", ":5", "1:2:3", "a:b", "1:-2", "0x1:0"] {
            assert!(Handle::parse(input).is_err(), "{input:?} should fail");
        }
    }

    #[test]
    fn test_parse_rejects_wide_components() {
        assert!(Handle::parse("65536:0").is_err());
        assert!(Handle::parse("1:65536").is_err());
    }

    #[test]
    fn test_u32_encoding() {
        let h = Handle::new(1, 14);
        assert_eq!(h.as_u32(), 0x1_000E);
        assert_eq!(Handle::from_u32(h.as_u32()), h);
        assert_eq!(Handle::from_u32(0xFFFF_FFFF), Handle::new(0xFFFF, 0xFFFF));
    }

    #[test]
    fn test_ordering_lexicographic() {
        assert!(Handle::new(1, 0) < Handle::new(1, 1));
        assert!(Handle::new(1, 999) < Handle::new(2, 0));
    }

    #[test]
    fn test_is_qdisc() {
        assert!(Handle::new(1, 0).is_qdisc());
        assert!(!Handle::new(1, 14).is_qdisc());
    }

    #[test]
    fn test_serde_as_string() {
        let h = Handle::new(1, 14);
        assert_eq!(serde_json::to_string(&h).unwrap(), "\"1:14\"");
        let back: Handle = serde_json::from_str("\"1:14\"").unwrap();
        assert_eq!(back, h);
    }
}
