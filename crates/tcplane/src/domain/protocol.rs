//! Transport and link protocol value objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// An IP transport protocol, as carried in the IPv4 protocol field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// TCP (protocol number 6).
    Tcp,
    /// UDP (protocol number 17).
    Udp,
    /// ICMP (protocol number 1).
    Icmp,
    /// Any other protocol number.
    Other(u8),
}

impl TransportProtocol {
    /// The IANA protocol number.
    pub const fn number(&self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Other(n) => *n,
        }
    }

    /// Construct from a protocol number, collapsing well-known values.
    pub const fn from_number(n: u8) -> Self {
        match n {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Icmp => f.write_str("icmp"),
            Self::Other(n) => write!(f, "ipproto-{n}"),
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => {
                if let Some(n) = other.strip_prefix("ipproto-") {
                    let n = n.parse().map_err(|_| DomainError::InvalidFormat {
                        what: "transport protocol",
                        input: s.to_string(),
                    })?;
                    return Ok(Self::from_number(n));
                }
                Err(DomainError::InvalidFormat {
                    what: "transport protocol",
                    input: s.to_string(),
                })
            }
        }
    }
}

/// The link-layer protocol a filter attaches to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LinkProtocol {
    /// All link protocols (ETH_P_ALL).
    All,
    /// IPv4 (ETH_P_IP).
    #[default]
    Ip,
    /// IPv6 (ETH_P_IPV6).
    Ipv6,
}

impl LinkProtocol {
    /// The ethertype in host byte order.
    pub const fn ethertype(&self) -> u16 {
        match self {
            Self::All => 0x0003,
            Self::Ip => 0x0800,
            Self::Ipv6 => 0x86DD,
        }
    }
}

impl fmt::Display for LinkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Ip => f.write_str("ip"),
            Self::Ipv6 => f.write_str("ipv6"),
        }
    }
}
