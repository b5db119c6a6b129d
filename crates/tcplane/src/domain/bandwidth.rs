//! Bandwidth value object.
//!
//! A [`Bandwidth`] is a non-negative number of bits per second. It parses
//! from the unit-suffixed strings used throughout the API ("100Mbps",
//! "1gbit", "2.5 Gbps") and formats back with the largest unit that fits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::DomainError;

/// Recognized unit suffixes, largest first, with their bit multipliers.
///
/// Both the SI-style ("mbps") and iproute2-style ("mbit") spellings are
/// accepted, case-insensitively.
const UNITS: &[(&str, &str, u64)] = &[
    ("tbps", "tbit", 1_000_000_000_000),
    ("gbps", "gbit", 1_000_000_000),
    ("mbps", "mbit", 1_000_000),
    ("kbps", "kbit", 1_000),
    ("bps", "bit", 1),
];

/// A bandwidth in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bandwidth(u64);

impl Bandwidth {
    /// Zero bits per second.
    pub const ZERO: Self = Self(0);

    /// Construct from raw bits per second.
    pub const fn from_bps(bits_per_second: u64) -> Self {
        Self(bits_per_second)
    }

    /// Construct from kilobits per second.
    pub const fn from_kbps(kbps: u64) -> Self {
        Self(kbps * 1_000)
    }

    /// Construct from megabits per second.
    pub const fn from_mbps(mbps: u64) -> Self {
        Self(mbps * 1_000_000)
    }

    /// Construct from gigabits per second.
    pub const fn from_gbps(gbps: u64) -> Self {
        Self(gbps * 1_000_000_000)
    }

    /// Parse a unit-suffixed bandwidth string.
    ///
    /// Accepted shape: optional whitespace, an integer or decimal number,
    /// optional whitespace, a unit suffix. Decimal prefixes are scaled to
    /// integer bits per second; anything that would overflow `u64` is an
    /// error rather than a silent wrap.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::InvalidFormat {
            what: "bandwidth",
            input: input.to_string(),
        };

        let s = input.trim();
        if s.is_empty() {
            return Err(invalid());
        }

        let split = s
            .find(|c: char| c != '.' && !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (number, unit) = s.split_at(split);
        let number = number.trim();
        let unit = unit.trim();
        if number.is_empty() || unit.is_empty() {
            return Err(invalid());
        }

        let multiplier = unit_multiplier(unit).ok_or_else(invalid)?;

        let (whole, frac) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
            || frac.contains('.')
        {
            return Err(invalid());
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };

        let mut bits = whole
            .checked_mul(multiplier as u128)
            .ok_or_else(|| overflow(input))?;

        if !frac.is_empty() {
            // Scale the fractional digits against the unit multiplier. More
            // precision than the unit carries is a format error, not a
            // rounding opportunity.
            let scale = 10u128.checked_pow(frac.len() as u32).ok_or_else(invalid)?;
            let frac: u128 = frac.parse().map_err(|_| invalid())?;
            let contribution = frac
                .checked_mul(multiplier as u128)
                .ok_or_else(|| overflow(input))?;
            if contribution % scale != 0 {
                return Err(DomainError::OutOfRange {
                    what: "bandwidth",
                    detail: format!("{input:?} is finer than one bit per second"),
                });
            }
            bits = bits
                .checked_add(contribution / scale)
                .ok_or_else(|| overflow(input))?;
        }

        u64::try_from(bits)
            .map(Self)
            .map_err(|_| overflow(input))
    }

    /// The value in bits per second.
    pub const fn bits_per_second(&self) -> u64 {
        self.0
    }

    /// The value in whole bytes per second.
    pub const fn bytes_per_second(&self) -> u64 {
        self.0 / 8
    }

    /// Checked addition; `None` on overflow.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// True if the bandwidth is zero.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Format with the largest unit that does not exceed the value.
    ///
    /// Exact values print without a fraction ("100Mbps"); inexact ones keep
    /// full precision ("1.234567Mbps") so that parsing the result recovers
    /// the original bit count.
    pub fn human_readable(&self) -> String {
        let v = self.0;
        let (label, mult) = UNITS
            .iter()
            .find(|(_, _, mult)| v >= *mult)
            .map(|(si, _, mult)| (*si, *mult))
            .unwrap_or(("bps", 1));

        let whole = v / mult;
        let rem = v % mult;
        let label = display_label(label);
        if rem == 0 {
            return format!("{whole}{label}");
        }

        // The multipliers are powers of ten, so the remainder expands to an
        // exact decimal fraction.
        let digits = mult.ilog10() as usize;
        let frac = format!("{:0width$}", rem, width = digits);
        let frac = frac.trim_end_matches('0');
        format!("{whole}.{frac}{label}")
    }
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let unit = unit.to_ascii_lowercase();
    UNITS
        .iter()
        .find(|(si, iproute, _)| unit == *si || unit == *iproute)
        .map(|(_, _, mult)| *mult)
}

fn display_label(si: &str) -> &'static str {
    match si {
        "tbps" => "Tbps",
        "gbps" => "Gbps",
        "mbps" => "Mbps",
        "kbps" => "Kbps",
        _ => "bps",
    }
}

fn overflow(input: &str) -> DomainError {
    DomainError::OutOfRange {
        what: "bandwidth",
        detail: format!("{input:?} overflows 64-bit bits per second"),
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.human_readable())
    }
}

impl FromStr for Bandwidth {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Events persist bandwidths as raw bits per second.
impl Serialize for Bandwidth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_units() {
        assert_eq!(Bandwidth::parse("100bps").unwrap().bits_per_second(), 100);
        assert_eq!(
            Bandwidth::parse("100kbps").unwrap().bits_per_second(),
            100_000
        );
        assert_eq!(
            Bandwidth::parse("100Mbps").unwrap().bits_per_second(),
            100_000_000
        );
        assert_eq!(
            Bandwidth::parse("1Gbps").unwrap().bits_per_second(),
            1_000_000_000
        );
        assert_eq!(
            Bandwidth::parse("2Tbps").unwrap().bits_per_second(),
            2_000_000_000_000
        );
    }

    #[test]
    fn test_parse_iproute_spellings() {
        assert_eq!(Bandwidth::parse("8bit").unwrap().bits_per_second(), 8);
        assert_eq!(
            Bandwidth::parse("10mbit").unwrap().bits_per_second(),
            10_000_000
        );
        assert_eq!(
            Bandwidth::parse("1gbit").unwrap().bits_per_second(),
            1_000_000_000
        );
    }

    #[test]
    fn test_parse_case_and_whitespace() {
        assert_eq!(
            Bandwidth::parse("  100 MBPS ").unwrap().bits_per_second(),
            100_000_000
        );
        assert_eq!(
            Bandwidth::parse("1gBpS").unwrap().bits_per_second(),
            1_000_000_000
        );
    }

    #[test]
    fn test_parse_decimal_prefix() {
        assert_eq!(
            Bandwidth::parse("1.5Mbps").unwrap().bits_per_second(),
            1_500_000
        );
        assert_eq!(
            Bandwidth::parse("0.5Gbps").unwrap().bits_per_second(),
            500_000_000
        );
        assert_eq!(
            Bandwidth::parse("2.25kbps").unwrap().bits_per_second(),
            2_250
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in ["", "   ", "Mbps", "100", "100 zps", "1..5Mbps", "-5Mbps"] {
            assert!(Bandwidth::parse(input).is_err(), "{input:?} should fail");
        }
    }

    #[test]
    fn test_parse_rejects_sub_bit_precision() {
        assert!(Bandwidth::parse("1.5bps").is_err());
        assert!(Bandwidth::parse("0.0001kbps").is_err());
    }

    #[test]
    fn test_parse_rejects_overflow() {
        assert!(Bandwidth::parse("99999999999Tbps").is_err());
    }

    #[test]
    fn test_human_readable() {
        assert_eq!(Bandwidth::from_bps(100).human_readable(), "100bps");
        assert_eq!(Bandwidth::from_kbps(100).human_readable(), "100Kbps");
        assert_eq!(Bandwidth::from_mbps(100).human_readable(), "100Mbps");
        assert_eq!(Bandwidth::from_gbps(1).human_readable(), "1Gbps");
        assert_eq!(Bandwidth::from_bps(1_500_000).human_readable(), "1.5Mbps");
        assert_eq!(Bandwidth::from_bps(999).human_readable(), "999bps");
    }

    #[test]
    fn test_human_readable_round_trip() {
        for bps in [
            0u64,
            1,
            7,
            999,
            1_000,
            1_001,
            1_234_567,
            100_000_000,
            1_000_000_001,
            2_000_000_000_000,
        ] {
            let b = Bandwidth::from_bps(bps);
            let back = Bandwidth::parse(&b.human_readable()).unwrap();
            assert_eq!(back, b, "round trip failed for {bps} bps");
        }
    }

    #[test]
    fn test_ordering_and_add() {
        let a = Bandwidth::from_mbps(100);
        let b = Bandwidth::from_mbps(200);
        assert!(a < b);
        assert_eq!(a.checked_add(b).unwrap(), Bandwidth::from_mbps(300));
        assert!(Bandwidth::from_bps(u64::MAX).checked_add(a).is_none());
    }

    #[test]
    fn test_serde_as_bits_per_second() {
        let b = Bandwidth::from_mbps(100);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "100000000");
        let back: Bandwidth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
