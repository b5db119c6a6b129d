//! Fluent policy builder.
//!
//! A [`Controller`] accumulates a declarative bandwidth policy for one
//! device, validates it as a whole, and emits the command sequence in a
//! single atomic commit. Handles are derived deterministically from class
//! priorities, so re-applying the same policy is idempotent.
//!
//! # Example
//!
//! ```ignore
//! use tcplane::Controller;
//!
//! let mut controller = Controller::new("eth0");
//! controller.with_hard_limit_bandwidth("1Gbps");
//! controller
//!     .create_traffic_class("database")
//!     .with_guaranteed_bandwidth("100Mbps")
//!     .with_soft_limit_bandwidth("200Mbps")
//!     .with_priority(4)
//!     .for_destination("192.168.1.10")
//!     .apply()
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::command::{Command, MatchArg};
use crate::context::OpContext;
use crate::domain::{
    Bandwidth, DeviceName, DomainError, FilterPriority, Handle, Priority,
    TrafficControlAggregate, TransportProtocol,
};
use crate::error::Result;
use crate::query::{ClassStatistics, DeviceStatistics, QdiscStatistics};
use crate::service::TrafficControlService;

/// Root qdisc handle used by the builder's handle scheme.
const ROOT: Handle = Handle::new(1, 0);
/// Catch-all default class created on every apply.
const DEFAULT_CLASS: Handle = Handle::new(1, 999);
/// Guaranteed rate of the default class.
const DEFAULT_CLASS_RATE: &str = "1Mbps";
/// Classes land at `1:(priority + CLASS_MINOR_OFFSET)`.
const CLASS_MINOR_OFFSET: u16 = 10;
/// Filter priorities for class `i` start at `FILTER_BASE + i * FILTER_STRIDE`.
const FILTER_BASE: u32 = 100;
const FILTER_STRIDE: u32 = 10;

/// One declared traffic class, accumulated raw and validated at apply.
#[derive(Debug, Clone, Default)]
struct TrafficClassSpec {
    name: String,
    rate: Option<String>,
    ceil: Option<String>,
    priority: Option<u8>,
    matches: Vec<MatchArg>,
}

/// A validated class, ready to emit.
struct PlannedClass {
    spec: TrafficClassSpec,
    handle: Handle,
    filter_base: u16,
}

/// Declarative traffic-control policy for one device.
pub struct Controller {
    service: Arc<TrafficControlService>,
    device: String,
    total: Option<String>,
    classes: Vec<TrafficClassSpec>,
    timeout: Option<Duration>,
}

impl Controller {
    /// A controller over a fully in-memory service (mock adapter). Use
    /// [`Controller::with_service`] to target a real kernel.
    pub fn new(device: &str) -> Self {
        Self::with_service(TrafficControlService::in_memory(), device)
    }

    /// A controller over an existing service.
    pub fn with_service(service: Arc<TrafficControlService>, device: &str) -> Self {
        Self {
            service,
            device: device.to_string(),
            total: None,
            classes: Vec::new(),
            timeout: None,
        }
    }

    /// The service this controller commits through.
    pub fn service(&self) -> &Arc<TrafficControlService> {
        &self.service
    }

    /// Declare the device's total bandwidth. Required before apply; every
    /// class rate and ceiling is validated against it.
    pub fn with_hard_limit_bandwidth(&mut self, rate: &str) -> &mut Self {
        self.total = Some(rate.to_string());
        self
    }

    /// Time out commands issued by this controller.
    pub fn with_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Start declaring a traffic class.
    pub fn create_traffic_class(&mut self, name: &str) -> TrafficClassBuilder<'_> {
        TrafficClassBuilder {
            controller: self,
            spec: TrafficClassSpec {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    fn op_context(&self) -> OpContext {
        match self.timeout {
            Some(timeout) => OpContext::with_timeout(timeout),
            None => OpContext::new(),
        }
    }

    /// Validate the declared policy and commit it as one atomic batch.
    ///
    /// All validation happens before any command is issued, so a rejected
    /// policy leaves no trace. Pieces that already exist (from a previous
    /// apply) are skipped, which makes re-apply, including the retry after
    /// a [`crate::Error::ConcurrencyConflict`], converge instead of
    /// colliding.
    ///
    /// An error after the commit (a kernel rejection from the applier) is
    /// surfaced too, but by then the event log is authoritative;
    /// [`TrafficControlService::reapply`] can re-drive it.
    pub async fn apply(&mut self) -> Result<()> {
        let ctx = self.op_context();
        let device = DeviceName::parse(&self.device)?;
        let total = self.validate_total()?;
        let planned = self.validate_classes(total)?;

        let mut aggregate = self.service.commands().load_aggregate(&device).await?;
        let commands = self.plan_commands(&planned, &aggregate);
        if commands.is_empty() {
            debug!(device = %device, "policy already applied, nothing to do");
            return Ok(());
        }

        let outcome = self
            .service
            .commands()
            .commit(&ctx, &mut aggregate, &commands)
            .await?;

        if let Some(failure) = outcome.subscriber_failures.into_iter().next() {
            // The commit stands; the caller learns the kernel disagreed.
            return Err(failure.error);
        }
        Ok(())
    }

    /// Remove the device's root qdisc; the kernel drops the whole tree.
    pub async fn reset(&self) -> Result<()> {
        let ctx = self.op_context();
        let device = DeviceName::parse(&self.device)?;
        self.service
            .adapter()
            .delete_qdisc(&ctx, &device, ROOT)
            .await?;
        Ok(())
    }

    /// Live statistics for the whole device.
    pub async fn get_statistics(&self) -> Result<DeviceStatistics> {
        let ctx = self.op_context();
        self.service
            .queries()
            .get_device_statistics(&ctx, &self.device)
            .await
    }

    /// Live statistics for one qdisc.
    pub async fn get_qdisc_statistics(&self, handle: &str) -> Result<QdiscStatistics> {
        let ctx = self.op_context();
        self.service
            .queries()
            .get_qdisc_statistics(&ctx, &self.device, handle)
            .await
    }

    /// Live statistics for one class.
    pub async fn get_class_statistics(&self, handle: &str) -> Result<ClassStatistics> {
        let ctx = self.op_context();
        self.service
            .queries()
            .get_class_statistics(&ctx, &self.device, handle)
            .await
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn validate_total(&self) -> Result<Bandwidth> {
        let raw = self
            .total
            .as_ref()
            .ok_or_else(|| DomainError::rejected("total bandwidth", "missing"))?;
        let total = Bandwidth::parse(raw)?;
        if total.is_zero() {
            return Err(DomainError::rejected("total bandwidth", "must be positive").into());
        }
        Ok(total)
    }

    fn validate_classes(&self, total: Bandwidth) -> Result<Vec<PlannedClass>> {
        let mut planned = Vec::with_capacity(self.classes.len());
        let mut rate_sum = Bandwidth::ZERO;
        let mut seen_priorities = Vec::new();

        for (index, spec) in self.classes.iter().enumerate() {
            let rate_raw = spec
                .rate
                .as_ref()
                .ok_or_else(|| DomainError::rejected("rate", "missing"))?;
            let rate = Bandwidth::parse(rate_raw)?;

            let priority_raw = spec
                .priority
                .ok_or_else(|| DomainError::rejected("priority", "missing"))?;
            let priority = Priority::new(priority_raw)?;

            let ceil = match &spec.ceil {
                Some(raw) => Bandwidth::parse(raw)?,
                None => rate,
            };

            if rate > ceil {
                return Err(DomainError::rejected("rate", "exceeds ceil").into());
            }
            if rate > total {
                return Err(DomainError::rejected("rate", "exceeds total").into());
            }
            if ceil > total {
                return Err(DomainError::rejected("ceil", "exceeds total").into());
            }

            rate_sum = rate_sum
                .checked_add(rate)
                .filter(|sum| *sum <= total)
                .ok_or_else(|| {
                    DomainError::rejected("rate", "sum of guaranteed bandwidth exceeds total")
                })?;

            if seen_priorities.contains(&priority_raw) {
                return Err(DomainError::rejected(
                    "priority",
                    format!("duplicate priority {priority_raw}"),
                )
                .into());
            }
            seen_priorities.push(priority_raw);

            // Each match consumes one priority from the class's interval;
            // spilling past it would overlap the next class.
            let filter_base = FILTER_BASE + FILTER_STRIDE * index as u32;
            let slots = spec.matches.len().max(1) as u32;
            if slots > FILTER_STRIDE || filter_base + slots - 1 > u16::MAX as u32 {
                return Err(DomainError::rejected("filter priority", "overflow").into());
            }

            planned.push(PlannedClass {
                spec: spec.clone(),
                handle: Handle::new(ROOT.major(), priority.value() as u16 + CLASS_MINOR_OFFSET),
                filter_base: filter_base as u16,
            });
        }

        Ok(planned)
    }

    // ------------------------------------------------------------------
    // Command planning
    // ------------------------------------------------------------------

    fn plan_commands(
        &self,
        planned: &[PlannedClass],
        aggregate: &TrafficControlAggregate,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        let device = self.device.clone();

        if aggregate.root_qdisc().is_none() {
            commands.push(Command::CreateHtbQdisc {
                device: device.clone(),
                handle: ROOT.to_string(),
                default_class: DEFAULT_CLASS.to_string(),
                r2q: None,
            });
        }

        for class in planned {
            if aggregate.class(class.handle).is_none() {
                commands.push(Command::CreateHtbClass {
                    device: device.clone(),
                    parent: ROOT.to_string(),
                    handle: class.handle.to_string(),
                    name: class.spec.name.clone(),
                    rate: class.spec.rate.clone().unwrap_or_default(),
                    ceil: class.spec.ceil.clone(),
                });
            }

            let emitted: Vec<(u16, Vec<MatchArg>)> = if class.spec.matches.is_empty() {
                // No conditions declared: a catch-all filter routes
                // unclassified traffic to the class.
                vec![(class.filter_base, Vec::new())]
            } else {
                class
                    .spec
                    .matches
                    .iter()
                    .enumerate()
                    .map(|(k, m)| (class.filter_base + k as u16, vec![m.clone()]))
                    .collect()
            };

            for (priority, matches) in emitted {
                let handle = Handle::new(0, priority);
                let exists = FilterPriority::new(priority)
                    .map(|p| aggregate.filter_exists(ROOT, p, handle))
                    .unwrap_or(false);
                if !exists {
                    commands.push(Command::CreateFilter {
                        device: device.clone(),
                        parent: ROOT.to_string(),
                        priority,
                        handle: handle.to_string(),
                        flow_id: class.handle.to_string(),
                        link_protocol: Default::default(),
                        matches,
                    });
                }
            }
        }

        if aggregate.class(DEFAULT_CLASS).is_none() {
            commands.push(Command::CreateHtbClass {
                device,
                parent: ROOT.to_string(),
                handle: DEFAULT_CLASS.to_string(),
                name: "default".to_string(),
                rate: DEFAULT_CLASS_RATE.to_string(),
                ceil: self.total.clone(),
            });
        }

        commands
    }
}

/// Builder for one traffic class; finish with [`TrafficClassBuilder::done`]
/// or apply the whole policy with [`TrafficClassBuilder::apply`].
pub struct TrafficClassBuilder<'a> {
    controller: &'a mut Controller,
    spec: TrafficClassSpec,
}

impl<'a> TrafficClassBuilder<'a> {
    /// The class's guaranteed bandwidth (HTB rate).
    pub fn with_guaranteed_bandwidth(mut self, rate: &str) -> Self {
        self.spec.rate = Some(rate.to_string());
        self
    }

    /// The class's borrowing ceiling (HTB ceil). Defaults to the
    /// guaranteed bandwidth.
    pub fn with_soft_limit_bandwidth(mut self, ceil: &str) -> Self {
        self.spec.ceil = Some(ceil.to_string());
        self
    }

    /// The class's priority, 0 (highest) through 7. Required.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.spec.priority = Some(priority);
        self
    }

    /// Steer traffic to a destination network (CIDR or bare IPv4).
    pub fn for_destination(mut self, cidr: &str) -> Self {
        self.spec.matches.push(MatchArg::IpDestination(cidr.to_string()));
        self
    }

    /// Steer traffic from a source network (CIDR or bare IPv4).
    pub fn for_source(mut self, cidr: &str) -> Self {
        self.spec.matches.push(MatchArg::IpSource(cidr.to_string()));
        self
    }

    /// Steer traffic to a destination port. Repeatable.
    pub fn for_port(mut self, port: u16) -> Self {
        self.spec.matches.push(MatchArg::PortDestination(port));
        self
    }

    /// Steer traffic from a source port. Repeatable.
    pub fn for_source_port(mut self, port: u16) -> Self {
        self.spec.matches.push(MatchArg::PortSource(port));
        self
    }

    /// Steer traffic of one transport protocol.
    pub fn for_protocol(mut self, protocol: TransportProtocol) -> Self {
        self.spec.matches.push(MatchArg::Protocol(protocol));
        self
    }

    /// Steer traffic carrying a netfilter mark (fw classifier).
    pub fn for_mark(mut self, value: u32) -> Self {
        self.spec.matches.push(MatchArg::Mark { value, mask: None });
        self
    }

    /// Register the class and return to the controller.
    pub fn done(self) -> &'a mut Controller {
        self.controller.classes.push(self.spec);
        self.controller
    }

    /// Register the class and apply the whole policy.
    pub async fn apply(self) -> Result<()> {
        self.done().apply().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    async fn rejected(controller: &mut Controller) -> (&'static str, String) {
        match controller.apply().await.unwrap_err() {
            Error::Domain(DomainError::ValueRejected { field, reason }) => (field, reason),
            other => panic!("expected ValueRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_total_is_rejected() {
        let mut controller = Controller::new("eth0");
        controller
            .create_traffic_class("db")
            .with_guaranteed_bandwidth("10Mbps")
            .with_priority(1)
            .done();
        let (field, reason) = rejected(&mut controller).await;
        assert_eq!(field, "total bandwidth");
        assert_eq!(reason, "missing");
    }

    #[tokio::test]
    async fn test_missing_priority_is_rejected() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("1Gbps");
        controller
            .create_traffic_class("x")
            .with_guaranteed_bandwidth("10Mbps")
            .done();
        let (field, reason) = rejected(&mut controller).await;
        assert_eq!(field, "priority");
        assert_eq!(reason, "missing");
    }

    #[tokio::test]
    async fn test_rate_above_total_is_rejected() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("50Mbps");
        controller
            .create_traffic_class("video")
            .with_guaranteed_bandwidth("100Mbps")
            .with_priority(3)
            .done();
        let (field, reason) = rejected(&mut controller).await;
        assert_eq!(field, "rate");
        assert_eq!(reason, "exceeds total");
    }

    #[tokio::test]
    async fn test_rate_above_ceil_is_rejected() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("1Gbps");
        controller
            .create_traffic_class("db")
            .with_guaranteed_bandwidth("200Mbps")
            .with_soft_limit_bandwidth("100Mbps")
            .with_priority(2)
            .done();
        let (field, reason) = rejected(&mut controller).await;
        assert_eq!(field, "rate");
        assert_eq!(reason, "exceeds ceil");
    }

    #[tokio::test]
    async fn test_rate_sum_above_total_is_rejected() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("100Mbps");
        controller
            .create_traffic_class("a")
            .with_guaranteed_bandwidth("60Mbps")
            .with_priority(1)
            .done()
            .create_traffic_class("b")
            .with_guaranteed_bandwidth("60Mbps")
            .with_priority(2)
            .done();
        let (field, reason) = rejected(&mut controller).await;
        assert_eq!(field, "rate");
        assert!(reason.contains("sum"));
    }

    #[tokio::test]
    async fn test_duplicate_priority_is_rejected() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("1Gbps");
        controller
            .create_traffic_class("a")
            .with_guaranteed_bandwidth("10Mbps")
            .with_priority(3)
            .done()
            .create_traffic_class("b")
            .with_guaranteed_bandwidth("10Mbps")
            .with_priority(3)
            .done();
        let (field, reason) = rejected(&mut controller).await;
        assert_eq!(field, "priority");
        assert!(reason.contains("duplicate"));
    }

    #[tokio::test]
    async fn test_too_many_matches_overflow_the_priority_interval() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("1Gbps");
        let mut class = controller
            .create_traffic_class("wide")
            .with_guaranteed_bandwidth("10Mbps")
            .with_priority(0);
        for port in 0..11u16 {
            class = class.for_port(8000 + port);
        }
        class.done();
        let (field, reason) = rejected(&mut controller).await;
        assert_eq!(field, "filter priority");
        assert_eq!(reason, "overflow");
    }

    #[tokio::test]
    async fn test_rejected_policy_emits_no_events() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("50Mbps");
        controller
            .create_traffic_class("video")
            .with_guaranteed_bandwidth("100Mbps")
            .with_priority(3)
            .done();
        let _ = controller.apply().await;

        let view = controller
            .service()
            .queries()
            .get_configuration("eth0")
            .unwrap();
        assert_eq!(view.version, 0);
    }

    #[tokio::test]
    async fn test_class_handles_follow_priority() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("1Gbps");
        controller
            .create_traffic_class("db")
            .with_guaranteed_bandwidth("100Mbps")
            .with_priority(4)
            .apply()
            .await
            .unwrap();

        let view = controller
            .service()
            .queries()
            .get_configuration("eth0")
            .unwrap();
        assert!(view.class("1:14").is_some(), "priority 4 lands at 1:14");
        assert!(view.class("1:999").is_some(), "default class is created");
    }

    #[tokio::test]
    async fn test_reapply_is_idempotent() {
        let mut controller = Controller::new("eth0");
        controller.with_hard_limit_bandwidth("1Gbps");
        controller
            .create_traffic_class("db")
            .with_guaranteed_bandwidth("100Mbps")
            .with_priority(4)
            .for_destination("192.168.1.10")
            .apply()
            .await
            .unwrap();

        let version_before = controller
            .service()
            .queries()
            .get_configuration("eth0")
            .unwrap()
            .version;

        controller.apply().await.unwrap();

        let version_after = controller
            .service()
            .queries()
            .get_configuration("eth0")
            .unwrap()
            .version;
        assert_eq!(version_before, version_after, "nothing new to commit");
    }
}
