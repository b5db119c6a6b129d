//! The per-device traffic-control aggregate.
//!
//! One [`TrafficControlAggregate`] exists per device; its identity is the
//! device name and its state is the fold of the device's event log.
//! Instances are ephemeral: a command handler replays the log, invokes one
//! or more operations, commits the pending events and drops the instance.
//!
//! Every operation follows the same shape: check preconditions against
//! current state, produce exactly one event, then apply that event through
//! the same code path replay uses. A failed precondition leaves the state
//! untouched and emits nothing.

use std::collections::BTreeMap;

use super::bandwidth::Bandwidth;
use super::class::{HtbClass, derive_burst};
use super::device::DeviceName;
use super::error::{DomainError, Result};
use super::event::Event;
use super::filter::{Filter, Match};
use super::handle::Handle;
use super::priority::FilterPriority;
use super::protocol::LinkProtocol;
use super::qdisc::{Qdisc, QdiscCommon, QdiscSpec};

/// Event-sourced TC tree for one device.
#[derive(Debug, Clone)]
pub struct TrafficControlAggregate {
    device: DeviceName,
    qdiscs: BTreeMap<Handle, Qdisc>,
    classes: BTreeMap<Handle, HtbClass>,
    filters: Vec<Filter>,
    version: u64,
    committed_version: u64,
    pending: Vec<Event>,
}

impl TrafficControlAggregate {
    /// An empty aggregate for a device with no history.
    pub fn new(device: DeviceName) -> Self {
        Self {
            device,
            qdiscs: BTreeMap::new(),
            classes: BTreeMap::new(),
            filters: Vec::new(),
            version: 0,
            committed_version: 0,
            pending: Vec::new(),
        }
    }

    /// Rebuild an aggregate by folding committed events in version order.
    ///
    /// No validation runs here: committed events are truth.
    pub fn replay<'a>(device: DeviceName, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut aggregate = Self::new(device);
        for event in events {
            aggregate.apply(event);
        }
        aggregate.committed_version = aggregate.version;
        aggregate
    }

    /// The device this aggregate governs.
    pub fn device(&self) -> &DeviceName {
        &self.device
    }

    /// Current version: committed events plus pending ones.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The version as of the last replay/commit; the expected version for
    /// an optimistic-concurrency save.
    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    /// Events produced by operations since the last commit.
    pub fn pending_events(&self) -> &[Event] {
        &self.pending
    }

    /// Drain the pending events for committing.
    pub fn take_pending(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }

    /// Record that pending events were durably committed.
    pub fn mark_committed(&mut self) {
        self.committed_version = self.version;
    }

    /// The root qdisc, if one exists.
    pub fn root_qdisc(&self) -> Option<&Qdisc> {
        self.qdiscs.values().find(|q| q.is_root())
    }

    /// Look up a qdisc by handle.
    pub fn qdisc(&self, handle: Handle) -> Option<&Qdisc> {
        self.qdiscs.get(&handle)
    }

    /// Look up a class by handle.
    pub fn class(&self, handle: Handle) -> Option<&HtbClass> {
        self.classes.get(&handle)
    }

    /// Classes in handle order.
    pub fn classes(&self) -> impl Iterator<Item = &HtbClass> {
        self.classes.values()
    }

    /// Filters in insertion order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// True if a filter with this `(parent, priority, handle)` key exists.
    pub fn filter_exists(&self, parent: Handle, priority: FilterPriority, handle: Handle) -> bool {
        self.filters
            .iter()
            .any(|f| f.key() == (parent, priority, handle))
    }

    /// An HTB root whose `default_class` no class realizes yet.
    ///
    /// Forward declaration is legal while events accumulate; the builder
    /// checks this resolves before a configuration is applied.
    pub fn unresolved_default_class(&self) -> Option<Handle> {
        let default_class = self.root_qdisc()?.htb_default_class()?;
        (!self.classes.contains_key(&default_class)).then_some(default_class)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Create the root HTB qdisc.
    pub fn create_htb_qdisc(
        &mut self,
        handle: Handle,
        default_class: Handle,
        r2q: u32,
    ) -> Result<()> {
        self.check_root_free()?;
        self.check_qdisc_handle_free(handle)?;
        self.record(Event::HtbQdiscCreated {
            device: self.device.clone(),
            handle,
            default_class,
            r2q,
        });
        Ok(())
    }

    /// Create the root TBF qdisc.
    pub fn create_tbf_qdisc(
        &mut self,
        handle: Handle,
        rate: Bandwidth,
        buffer: u32,
        limit: u32,
        burst: u32,
    ) -> Result<()> {
        self.check_root_free()?;
        self.check_qdisc_handle_free(handle)?;
        if rate.is_zero() {
            return Err(DomainError::rejected("rate", "must be positive"));
        }
        self.record(Event::TbfQdiscCreated {
            device: self.device.clone(),
            handle,
            rate,
            buffer,
            limit,
            burst,
        });
        Ok(())
    }

    /// Create the root PRIO qdisc.
    pub fn create_prio_qdisc(&mut self, handle: Handle, bands: u8, priomap: [u8; 16]) -> Result<()> {
        self.check_root_free()?;
        self.check_qdisc_handle_free(handle)?;
        if bands < 2 {
            return Err(DomainError::invariant(
                "prio-bands",
                format!("{bands} bands, need at least 2"),
            ));
        }
        if let Some(entry) = priomap.iter().find(|v| **v >= bands) {
            return Err(DomainError::invariant(
                "priomap-within-bands",
                format!("priomap entry {entry} not below {bands} bands"),
            ));
        }
        self.record(Event::PrioQdiscCreated {
            device: self.device.clone(),
            handle,
            bands,
            priomap,
        });
        Ok(())
    }

    /// Create the root FQ_CODEL qdisc.
    #[allow(clippy::too_many_arguments)]
    pub fn create_fq_codel_qdisc(
        &mut self,
        handle: Handle,
        limit: u32,
        flows: u32,
        target: u32,
        interval: u32,
        quantum: u32,
        ecn: bool,
    ) -> Result<()> {
        self.check_root_free()?;
        self.check_qdisc_handle_free(handle)?;
        if limit == 0 {
            return Err(DomainError::rejected("limit", "must be positive"));
        }
        if flows == 0 {
            return Err(DomainError::rejected("flows", "must be positive"));
        }
        if quantum == 0 {
            return Err(DomainError::rejected("quantum", "must be positive"));
        }
        self.record(Event::FqCodelQdiscCreated {
            device: self.device.clone(),
            handle,
            limit,
            flows,
            target,
            interval,
            quantum,
            ecn,
        });
        Ok(())
    }

    /// Create an HTB class under an existing qdisc or class.
    ///
    /// A zero `ceil` defaults to `rate`; `burst`/`cburst` are derived from
    /// rate and ceil (`bps / 80` bytes each).
    pub fn create_htb_class(
        &mut self,
        parent: Handle,
        handle: Handle,
        name: &str,
        rate: Bandwidth,
        ceil: Bandwidth,
    ) -> Result<()> {
        if !self.qdiscs.contains_key(&parent) && !self.classes.contains_key(&parent) {
            return Err(DomainError::UnknownParent {
                device: self.device.to_string(),
                parent: parent.to_string(),
            });
        }
        if self.classes.contains_key(&handle) {
            return Err(DomainError::HandleConflict {
                device: self.device.to_string(),
                handle: handle.to_string(),
            });
        }
        let ceil = if ceil.is_zero() { rate } else { ceil };
        if rate > ceil {
            return Err(DomainError::invariant(
                "rate-within-ceil",
                format!("rate {rate} exceeds ceil {ceil}"),
            ));
        }
        self.record(Event::HtbClassCreated {
            device: self.device.clone(),
            parent,
            handle,
            name: name.to_string(),
            rate,
            ceil,
            burst: derive_burst(rate),
            cburst: derive_burst(ceil),
        });
        Ok(())
    }

    /// Create a filter on an existing qdisc steering to an existing class.
    pub fn create_filter(
        &mut self,
        parent: Handle,
        priority: FilterPriority,
        handle: Handle,
        flow_id: Handle,
        link_protocol: LinkProtocol,
        matches: Vec<Match>,
    ) -> Result<()> {
        if !self.qdiscs.contains_key(&parent) {
            return Err(DomainError::UnknownParent {
                device: self.device.to_string(),
                parent: parent.to_string(),
            });
        }
        if !self.classes.contains_key(&flow_id) {
            return Err(DomainError::UnknownParent {
                device: self.device.to_string(),
                parent: flow_id.to_string(),
            });
        }
        if self.filter_exists(parent, priority, handle) {
            return Err(DomainError::HandleConflict {
                device: self.device.to_string(),
                handle: format!("{parent}#{priority}#{handle}"),
            });
        }
        self.record(Event::FilterCreated {
            device: self.device.clone(),
            parent,
            priority,
            handle,
            flow_id,
            link_protocol,
            matches,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event application (shared by operations and replay)
    // ------------------------------------------------------------------

    fn record(&mut self, event: Event) {
        self.apply(&event);
        self.pending.push(event);
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::HtbQdiscCreated {
                handle,
                default_class,
                r2q,
                ..
            } => {
                self.insert_qdisc(
                    *handle,
                    QdiscSpec::Htb {
                        default_class: *default_class,
                        r2q: *r2q,
                    },
                );
            }
            Event::TbfQdiscCreated {
                handle,
                rate,
                buffer,
                limit,
                burst,
                ..
            } => {
                self.insert_qdisc(
                    *handle,
                    QdiscSpec::Tbf {
                        rate: *rate,
                        buffer: *buffer,
                        limit: *limit,
                        burst: *burst,
                    },
                );
            }
            Event::PrioQdiscCreated {
                handle,
                bands,
                priomap,
                ..
            } => {
                self.insert_qdisc(
                    *handle,
                    QdiscSpec::Prio {
                        bands: *bands,
                        priomap: *priomap,
                    },
                );
            }
            Event::FqCodelQdiscCreated {
                handle,
                limit,
                flows,
                target,
                interval,
                quantum,
                ecn,
                ..
            } => {
                self.insert_qdisc(
                    *handle,
                    QdiscSpec::FqCodel {
                        limit: *limit,
                        flows: *flows,
                        target: *target,
                        interval: *interval,
                        quantum: *quantum,
                        ecn: *ecn,
                    },
                );
            }
            Event::HtbClassCreated {
                parent,
                handle,
                name,
                rate,
                ceil,
                burst,
                cburst,
                ..
            } => {
                self.classes.insert(
                    *handle,
                    HtbClass {
                        device: self.device.clone(),
                        parent: *parent,
                        handle: *handle,
                        name: name.clone(),
                        rate: *rate,
                        ceil: *ceil,
                        burst: *burst,
                        cburst: *cburst,
                        priority: None,
                    },
                );
                self.version += 1;
            }
            Event::FilterCreated {
                parent,
                priority,
                handle,
                flow_id,
                link_protocol,
                matches,
                ..
            } => {
                self.filters.push(Filter {
                    device: self.device.clone(),
                    parent: *parent,
                    priority: *priority,
                    handle: *handle,
                    flow_id: *flow_id,
                    link_protocol: *link_protocol,
                    matches: matches.clone(),
                });
                self.version += 1;
            }
        }
    }

    fn insert_qdisc(&mut self, handle: Handle, spec: QdiscSpec) {
        self.qdiscs.insert(
            handle,
            Qdisc {
                common: QdiscCommon {
                    device: self.device.clone(),
                    handle,
                    parent: None,
                },
                spec,
            },
        );
        self.version += 1;
    }

    /// Reconstruct the creation events implied by the current state:
    /// qdiscs, then classes in handle order, then filters in insertion
    /// order. Equals the folded event sequence as a set.
    pub fn to_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for qdisc in self.qdiscs.values() {
            events.push(match &qdisc.spec {
                QdiscSpec::Htb { default_class, r2q } => Event::HtbQdiscCreated {
                    device: self.device.clone(),
                    handle: qdisc.common.handle,
                    default_class: *default_class,
                    r2q: *r2q,
                },
                QdiscSpec::Tbf {
                    rate,
                    buffer,
                    limit,
                    burst,
                } => Event::TbfQdiscCreated {
                    device: self.device.clone(),
                    handle: qdisc.common.handle,
                    rate: *rate,
                    buffer: *buffer,
                    limit: *limit,
                    burst: *burst,
                },
                QdiscSpec::Prio { bands, priomap } => Event::PrioQdiscCreated {
                    device: self.device.clone(),
                    handle: qdisc.common.handle,
                    bands: *bands,
                    priomap: *priomap,
                },
                QdiscSpec::FqCodel {
                    limit,
                    flows,
                    target,
                    interval,
                    quantum,
                    ecn,
                } => Event::FqCodelQdiscCreated {
                    device: self.device.clone(),
                    handle: qdisc.common.handle,
                    limit: *limit,
                    flows: *flows,
                    target: *target,
                    interval: *interval,
                    quantum: *quantum,
                    ecn: *ecn,
                },
            });
        }
        for class in self.classes.values() {
            events.push(Event::HtbClassCreated {
                device: self.device.clone(),
                parent: class.parent,
                handle: class.handle,
                name: class.name.clone(),
                rate: class.rate,
                ceil: class.ceil,
                burst: class.burst,
                cburst: class.cburst,
            });
        }
        for filter in &self.filters {
            events.push(Event::FilterCreated {
                device: self.device.clone(),
                parent: filter.parent,
                priority: filter.priority,
                handle: filter.handle,
                flow_id: filter.flow_id,
                link_protocol: filter.link_protocol,
                matches: filter.matches.clone(),
            });
        }
        events
    }

    // ------------------------------------------------------------------
    // Shared precondition checks
    // ------------------------------------------------------------------

    fn check_root_free(&self) -> Result<()> {
        if let Some(root) = self.root_qdisc() {
            return Err(DomainError::invariant(
                "single-root-qdisc",
                format!("root qdisc {} already exists", root.common.handle),
            ));
        }
        Ok(())
    }

    fn check_qdisc_handle_free(&self, handle: Handle) -> Result<()> {
        if self.qdiscs.contains_key(&handle) {
            return Err(DomainError::HandleConflict {
                device: self.device.to_string(),
                handle: handle.to_string(),
            });
        }
        Ok(())
    }
}
