//! Packet classification: matches and filter entities.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::device::DeviceName;
use super::error::DomainError;
use super::handle::Handle;
use super::priority::FilterPriority;
use super::protocol::{LinkProtocol, TransportProtocol};

/// An IPv4 network in CIDR notation. A bare address is a /32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Cidr {
    /// Construct from an address and prefix length.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, DomainError> {
        if prefix_len > 32 {
            return Err(DomainError::OutOfRange {
                what: "cidr",
                detail: format!("prefix length {prefix_len} exceeds 32"),
            });
        }
        Ok(Self { addr, prefix_len })
    }

    /// Parse `"a.b.c.d"` (treated as /32) or `"a.b.c.d/len"`.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::InvalidFormat {
            what: "cidr",
            input: input.to_string(),
        };

        let s = input.trim();
        let (addr, prefix_len) = match s.split_once('/') {
            Some((addr, len)) => {
                let len: u8 = len.parse().map_err(|_| invalid())?;
                (addr, len)
            }
            None => (s, 32),
        };
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix_len)
    }

    /// The network address.
    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The prefix length.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The prefix as a 32-bit network mask in host byte order.
    pub const fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A host address renders bare, matching how callers wrote it.
        if self.prefix_len == 32 {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix_len)
        }
    }
}

impl FromStr for Cidr {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A single packet-match condition inside a filter.
///
/// Each variant carries a stable string rendering used in events; the
/// rendering and [`Match::parse`] round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Match {
    /// Match on the IPv4 source network.
    IpSource(Cidr),
    /// Match on the IPv4 destination network.
    IpDestination(Cidr),
    /// Match on the transport source port.
    PortSource(u16),
    /// Match on the transport destination port.
    PortDestination(u16),
    /// Match on the IP transport protocol.
    Protocol(TransportProtocol),
    /// Match on the firewall mark set by netfilter.
    Mark {
        /// Mark value to match.
        value: u32,
        /// Mask applied before comparison.
        mask: u32,
    },
}

impl Match {
    /// Match a firewall mark against the full 32-bit value.
    pub const fn mark(value: u32) -> Self {
        Self::Mark {
            value,
            mask: u32::MAX,
        }
    }

    /// The stable type tag used in persisted events.
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::IpSource(_) => "ip_src",
            Self::IpDestination(_) => "ip_dst",
            Self::PortSource(_) => "port_src",
            Self::PortDestination(_) => "port_dst",
            Self::Protocol(_) => "protocol",
            Self::Mark { .. } => "mark",
        }
    }

    /// The stable value rendering used in persisted events.
    pub fn render(&self) -> String {
        match self {
            Self::IpSource(cidr) | Self::IpDestination(cidr) => cidr.to_string(),
            Self::PortSource(port) | Self::PortDestination(port) => port.to_string(),
            Self::Protocol(proto) => proto.to_string(),
            Self::Mark { value, mask } => format!("{value:#x}/{mask:#x}"),
        }
    }

    /// Rebuild a match from its persisted `(type_tag, rendered_value)` pair.
    pub fn parse(type_tag: &str, value: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::InvalidFormat {
            what: "match",
            input: format!("{type_tag}={value}"),
        };
        let port = |value: &str| value.parse::<u16>().map_err(|_| invalid());

        match type_tag {
            "ip_src" => Ok(Self::IpSource(Cidr::parse(value)?)),
            "ip_dst" => Ok(Self::IpDestination(Cidr::parse(value)?)),
            "port_src" => Ok(Self::PortSource(port(value)?)),
            "port_dst" => Ok(Self::PortDestination(port(value)?)),
            "protocol" => Ok(Self::Protocol(value.parse()?)),
            "mark" => {
                let (v, m) = value.split_once('/').ok_or_else(invalid)?;
                let parse_hex = |s: &str| {
                    s.strip_prefix("0x")
                        .and_then(|h| u32::from_str_radix(h, 16).ok())
                        .ok_or_else(invalid)
                };
                Ok(Self::Mark {
                    value: parse_hex(v)?,
                    mask: parse_hex(m)?,
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// Persisted form of a [`Match`]: type tag plus rendered value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MatchRecord {
    match_type: String,
    value: String,
}

impl Serialize for Match {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MatchRecord {
            match_type: self.type_tag().to_string(),
            value: self.render(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Match {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = MatchRecord::deserialize(deserializer)?;
        Match::parse(&record.match_type, &record.value).map_err(serde::de::Error::custom)
    }
}

/// A classifier steering packets into a class.
///
/// Filters are keyed by `(parent, priority, handle)` within a device and
/// reference their target class by handle (`flow_id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Owning device.
    pub device: DeviceName,
    /// The qdisc the filter attaches to.
    pub parent: Handle,
    /// Match precedence; lower runs first.
    pub priority: FilterPriority,
    /// The filter's own handle.
    pub handle: Handle,
    /// The class matched packets are steered to.
    pub flow_id: Handle,
    /// Link-layer protocol the filter applies to.
    pub link_protocol: LinkProtocol,
    /// Conditions, all of which must match. Empty matches everything.
    pub matches: Vec<Match>,
}

impl Filter {
    /// The `(parent, priority, handle)` identity of this filter.
    pub fn key(&self) -> (Handle, FilterPriority, Handle) {
        (self.parent, self.priority, self.handle)
    }
}
