//! Qdisc entities.

use super::bandwidth::Bandwidth;
use super::device::DeviceName;
use super::handle::Handle;

/// Default HTB rate-to-quantum ratio.
pub const DEFAULT_R2Q: u32 = 10;

/// Attributes shared by every qdisc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdiscCommon {
    /// Owning device.
    pub device: DeviceName,
    /// The qdisc's handle (`M:0`).
    pub handle: Handle,
    /// Parent handle; `None` attaches at the root.
    pub parent: Option<Handle>,
}

/// Type-specific qdisc parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QdiscSpec {
    /// Hierarchical Token Bucket: classful, per-class rate and ceil.
    Htb {
        /// Class receiving unclassified traffic. May be forward-declared;
        /// it must exist by the time the configuration is applied.
        default_class: Handle,
        /// Rate-to-quantum ratio.
        r2q: u32,
    },
    /// Token Bucket Filter: classless single-rate shaper.
    Tbf {
        /// Shaping rate.
        rate: Bandwidth,
        /// Token buffer in bytes.
        buffer: u32,
        /// Queue limit in bytes.
        limit: u32,
        /// Burst in bytes; 0 derives from the rate at install time.
        burst: u32,
    },
    /// Strict priority scheduler.
    Prio {
        /// Number of bands, at least 2.
        bands: u8,
        /// Map from packet priority to band; every entry below `bands`.
        priomap: [u8; 16],
    },
    /// Fair queuing with CoDel queue management.
    FqCodel {
        /// Queue limit in packets.
        limit: u32,
        /// Number of flow queues.
        flows: u32,
        /// CoDel target delay in microseconds.
        target: u32,
        /// CoDel interval in microseconds.
        interval: u32,
        /// Bytes dequeued per flow per round.
        quantum: u32,
        /// Mark with ECN instead of dropping.
        ecn: bool,
    },
}

/// A qdisc entity: common attributes plus the type-specific spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qdisc {
    /// Shared attributes.
    pub common: QdiscCommon,
    /// Type-specific parameters.
    pub spec: QdiscSpec,
}

impl Qdisc {
    /// The kernel kind string for this qdisc type.
    pub const fn kind(&self) -> &'static str {
        match self.spec {
            QdiscSpec::Htb { .. } => "htb",
            QdiscSpec::Tbf { .. } => "tbf",
            QdiscSpec::Prio { .. } => "prio",
            QdiscSpec::FqCodel { .. } => "fq_codel",
        }
    }

    /// True when the qdisc attaches at the device root.
    pub const fn is_root(&self) -> bool {
        self.common.parent.is_none()
    }

    /// The HTB default class, if this is an HTB qdisc.
    pub fn htb_default_class(&self) -> Option<Handle> {
        match self.spec {
            QdiscSpec::Htb { default_class, .. } => Some(default_class),
            _ => None,
        }
    }
}
