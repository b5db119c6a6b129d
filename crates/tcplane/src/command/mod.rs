//! Commands: the write-side requests accepted by the control plane.
//!
//! Commands carry raw caller input (strings for devices, handles and
//! bandwidths); handlers validate structure and parse into value objects
//! before touching the aggregate, so every rejection happens pre-commit.

mod bus;
mod handlers;

pub use bus::{CommandBus, CommandOutcome};
pub use handlers::{CommandHandler, default_handlers};

use crate::domain::{LinkProtocol, TransportProtocol};

/// Raw match condition inside a [`Command::CreateFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchArg {
    /// Source network, CIDR or bare IPv4 address.
    IpSource(String),
    /// Destination network, CIDR or bare IPv4 address.
    IpDestination(String),
    /// Transport source port.
    PortSource(u16),
    /// Transport destination port.
    PortDestination(u16),
    /// Transport protocol.
    Protocol(TransportProtocol),
    /// Firewall mark; a missing mask means the full 32 bits.
    Mark {
        /// Mark value.
        value: u32,
        /// Comparison mask.
        mask: Option<u32>,
    },
}

/// A write-side request against one device's TC tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create the root HTB qdisc.
    CreateHtbQdisc {
        /// Target device.
        device: String,
        /// Qdisc handle, `"M:0"`.
        handle: String,
        /// Default class handle; may be forward-declared.
        default_class: String,
        /// Rate-to-quantum ratio; defaults to 10.
        r2q: Option<u32>,
    },

    /// Create the root TBF qdisc.
    CreateTbfQdisc {
        /// Target device.
        device: String,
        /// Qdisc handle.
        handle: String,
        /// Shaping rate with unit suffix, e.g. "50Mbps".
        rate: String,
        /// Token buffer in bytes.
        buffer: u32,
        /// Queue limit in bytes.
        limit: u32,
        /// Burst in bytes; 0 derives at install time.
        burst: u32,
    },

    /// Create the root PRIO qdisc.
    CreatePrioQdisc {
        /// Target device.
        device: String,
        /// Qdisc handle.
        handle: String,
        /// Number of bands.
        bands: u8,
        /// Priority-to-band map; must have exactly 16 entries.
        priomap: Vec<u8>,
    },

    /// Create the root FQ_CODEL qdisc.
    CreateFqCodelQdisc {
        /// Target device.
        device: String,
        /// Qdisc handle.
        handle: String,
        /// Queue limit in packets.
        limit: u32,
        /// Number of flow queues.
        flows: u32,
        /// CoDel target delay in microseconds.
        target: u32,
        /// CoDel interval in microseconds.
        interval: u32,
        /// Bytes per flow per round.
        quantum: u32,
        /// Enable ECN marking.
        ecn: bool,
    },

    /// Create an HTB class.
    CreateHtbClass {
        /// Target device.
        device: String,
        /// Parent qdisc or class handle.
        parent: String,
        /// The class's handle.
        handle: String,
        /// Policy name.
        name: String,
        /// Guaranteed bandwidth with unit suffix.
        rate: String,
        /// Ceiling bandwidth; `None` defaults to `rate`.
        ceil: Option<String>,
    },

    /// Create a classifier filter.
    CreateFilter {
        /// Target device.
        device: String,
        /// Parent qdisc handle.
        parent: String,
        /// Match precedence; must be non-zero.
        priority: u16,
        /// The filter's handle.
        handle: String,
        /// Target class handle.
        flow_id: String,
        /// Link-layer protocol.
        link_protocol: LinkProtocol,
        /// Match conditions; empty matches everything.
        matches: Vec<MatchArg>,
    },
}

impl Command {
    /// Stable command-type identifier used for handler registration.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CreateHtbQdisc { .. } => "create_htb_qdisc",
            Self::CreateTbfQdisc { .. } => "create_tbf_qdisc",
            Self::CreatePrioQdisc { .. } => "create_prio_qdisc",
            Self::CreateFqCodelQdisc { .. } => "create_fq_codel_qdisc",
            Self::CreateHtbClass { .. } => "create_htb_class",
            Self::CreateFilter { .. } => "create_filter",
        }
    }

    /// The device the command targets; also the aggregate identity.
    pub fn device(&self) -> &str {
        match self {
            Self::CreateHtbQdisc { device, .. }
            | Self::CreateTbfQdisc { device, .. }
            | Self::CreatePrioQdisc { device, .. }
            | Self::CreateFqCodelQdisc { device, .. }
            | Self::CreateHtbClass { device, .. }
            | Self::CreateFilter { device, .. } => device,
        }
    }
}
