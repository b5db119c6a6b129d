//! Netlink adapter boundary.
//!
//! The adapter translates committed domain entities into kernel TC
//! operations. One trait, multiple implementations: [`MockAdapter`] keeps
//! everything in memory (tests, non-privileged sandboxes, the builder's
//! default), [`netlink::NetlinkAdapter`] talks rtnetlink to a real kernel.

pub mod applier;
pub mod mock;
pub mod netlink;

pub use applier::EventApplier;
pub use mock::MockAdapter;
pub use netlink::NetlinkAdapter;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::OpContext;
use crate::domain::{DeviceName, Filter, FilterPriority, Handle, HtbClass, Qdisc};

/// Result type for adapter operations.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Failures from the kernel boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The device does not exist.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A handle could not be used where the kernel expected one.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// The kernel rejected the request.
    #[error("kernel rejected: {0}")]
    KernelRejected(String),

    /// The caller lacks CAP_NET_ADMIN (or equivalent).
    #[error("operation not permitted")]
    NotPermitted,

    /// The object already exists in the kernel.
    #[error("already exists")]
    AlreadyExists,

    /// Socket-level I/O failure.
    #[error("netlink I/O error: {0}")]
    Io(String),

    /// The operation's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Byte/packet/queue counters for a qdisc or class, as dumped from the
/// kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficCounters {
    /// Bytes transmitted.
    pub bytes: u64,
    /// Packets transmitted.
    pub packets: u64,
    /// Packets dropped.
    pub drops: u32,
    /// Times the object exceeded its limit.
    pub overlimits: u32,
    /// Requeue count.
    pub requeues: u32,
    /// Backlog in bytes.
    pub backlog: u32,
    /// Queue length in packets.
    pub qlen: u32,
}

/// A qdisc as reported by the kernel.
#[derive(Debug, Clone, Serialize)]
pub struct QdiscInfo {
    /// Qdisc handle.
    pub handle: Handle,
    /// Kind string ("htb", "tbf", ...).
    pub kind: String,
    /// Live counters.
    pub stats: TrafficCounters,
}

/// A class as reported by the kernel.
#[derive(Debug, Clone, Serialize)]
pub struct ClassInfo {
    /// Class handle.
    pub handle: Handle,
    /// Parent handle.
    pub parent: Handle,
    /// Kind string.
    pub kind: String,
    /// Live counters.
    pub stats: TrafficCounters,
}

/// A filter as reported by the kernel.
#[derive(Debug, Clone, Serialize)]
pub struct FilterInfo {
    /// The qdisc the filter attaches to.
    pub parent: Handle,
    /// Match precedence.
    pub priority: u16,
    /// Classifier kind ("u32", "fw").
    pub kind: String,
    /// Target class, when the classifier carries one.
    pub flow_id: Option<Handle>,
}

/// Kernel TC operations the core consumes.
///
/// Implementations may block on kernel I/O inside the async methods; the
/// core only requires that a call completes or returns an error. `ctx` is
/// checked before the operation starts.
#[async_trait]
pub trait TcAdapter: Send + Sync {
    /// Install a qdisc.
    async fn add_qdisc(&self, ctx: &OpContext, qdisc: &Qdisc) -> AdapterResult<()>;

    /// Install an HTB class.
    async fn add_class(&self, ctx: &OpContext, class: &HtbClass) -> AdapterResult<()>;

    /// Install a classifier filter.
    async fn add_filter(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<()>;

    /// Remove a qdisc (the kernel cascades classes and filters).
    async fn delete_qdisc(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        handle: Handle,
    ) -> AdapterResult<()>;

    /// Remove a class.
    async fn delete_class(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        handle: Handle,
    ) -> AdapterResult<()>;

    /// Remove a filter.
    async fn delete_filter(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        parent: Handle,
        priority: FilterPriority,
        handle: Handle,
    ) -> AdapterResult<()>;

    /// Dump the device's qdiscs with statistics.
    async fn get_qdiscs(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<QdiscInfo>>;

    /// Dump the device's classes with statistics.
    async fn get_classes(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<ClassInfo>>;

    /// Dump the device's filters.
    async fn get_filters(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<FilterInfo>>;
}

/// The classifier kind a filter compiles to: `fw` when it matches on the
/// firewall mark, `u32` otherwise.
///
/// A mark match cannot be combined with header matches; the `fw`
/// classifier has nowhere to put them.
pub fn classifier_kind(filter: &Filter) -> AdapterResult<&'static str> {
    use crate::domain::Match;

    let has_mark = filter
        .matches
        .iter()
        .any(|m| matches!(m, Match::Mark { .. }));
    if !has_mark {
        return Ok("u32");
    }
    if filter.matches.len() > 1 {
        return Err(AdapterError::KernelRejected(
            "fw classifier cannot combine mark and header matches".to_string(),
        ));
    }
    Ok("fw")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cidr, LinkProtocol, Match};

    fn filter(matches: Vec<Match>) -> Filter {
        Filter {
            device: DeviceName::parse("eth0").unwrap(),
            parent: Handle::ROOT,
            priority: FilterPriority::new(100).unwrap(),
            handle: Handle::new(0, 100),
            flow_id: Handle::new(1, 14),
            link_protocol: LinkProtocol::Ip,
            matches,
        }
    }

    #[test]
    fn test_header_matches_compile_to_u32() {
        let f = filter(vec![Match::IpDestination(Cidr::parse("10.0.0.0/8").unwrap())]);
        assert_eq!(classifier_kind(&f).unwrap(), "u32");

        // A catch-all with no matches is still a u32 filter.
        assert_eq!(classifier_kind(&filter(vec![])).unwrap(), "u32");
    }

    #[test]
    fn test_mark_match_compiles_to_fw() {
        let f = filter(vec![Match::mark(0x100)]);
        assert_eq!(classifier_kind(&f).unwrap(), "fw");
    }

    #[test]
    fn test_mark_mixed_with_headers_is_rejected() {
        let f = filter(vec![
            Match::mark(0x100),
            Match::PortDestination(443),
        ]);
        assert!(classifier_kind(&f).is_err());
    }
}
