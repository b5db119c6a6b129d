//! Traffic class entities.

use super::bandwidth::Bandwidth;
use super::device::DeviceName;
use super::handle::Handle;
use super::priority::Priority;

/// An HTB traffic class: a bandwidth-limited subtree beneath the HTB qdisc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtbClass {
    /// Owning device.
    pub device: DeviceName,
    /// Parent qdisc or class.
    pub parent: Handle,
    /// The class's own handle.
    pub handle: Handle,
    /// Human-readable name from the policy.
    pub name: String,
    /// Guaranteed bandwidth.
    pub rate: Bandwidth,
    /// Maximum bandwidth the class may borrow up to.
    pub ceil: Bandwidth,
    /// Token buffer for `rate`, in bytes.
    pub burst: u32,
    /// Token buffer for `ceil`, in bytes.
    pub cburst: u32,
    /// Scheduling priority; required before the policy is applied.
    pub priority: Option<Priority>,
}

/// Derive a burst buffer from a rate: `rate_bps / 8 / 10` bytes (a tenth
/// of a second at byte scale), saturating at `u32::MAX`.
pub fn derive_burst(rate: Bandwidth) -> u32 {
    u32::try_from(rate.bits_per_second() / 8 / 10).unwrap_or(u32::MAX)
}
