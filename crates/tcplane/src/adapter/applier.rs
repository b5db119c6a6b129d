//! Event applier: drives committed events into the kernel.
//!
//! Subscribed to the event bus, the applier translates each committed
//! event into the corresponding adapter call. Installation is idempotent:
//! a duplicate create answered with `AlreadyExists` counts as success, so
//! the same log can be re-driven to reconcile a device.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{AdapterError, TcAdapter};
use crate::bus::EventSubscriber;
use crate::context::OpContext;
use crate::domain::{Event, EventRecord, Filter, HtbClass, Qdisc, QdiscCommon, QdiscSpec};
use crate::error::Error;

/// Bridges the event bus to a [`TcAdapter`].
pub struct EventApplier {
    adapter: Arc<dyn TcAdapter>,
}

impl EventApplier {
    /// Wrap an adapter.
    pub fn new(adapter: Arc<dyn TcAdapter>) -> Self {
        Self { adapter }
    }

    /// Apply one committed event to the kernel.
    #[instrument(skip(self, ctx, event), fields(event_type = event.type_tag()))]
    pub async fn apply(&self, ctx: &OpContext, event: &Event) -> Result<(), Error> {
        let result = match event {
            Event::HtbQdiscCreated {
                device,
                handle,
                default_class,
                r2q,
            } => {
                self.adapter
                    .add_qdisc(
                        ctx,
                        &Qdisc {
                            common: QdiscCommon {
                                device: device.clone(),
                                handle: *handle,
                                parent: None,
                            },
                            spec: QdiscSpec::Htb {
                                default_class: *default_class,
                                r2q: *r2q,
                            },
                        },
                    )
                    .await
            }
            Event::TbfQdiscCreated {
                device,
                handle,
                rate,
                buffer,
                limit,
                burst,
            } => {
                self.adapter
                    .add_qdisc(
                        ctx,
                        &Qdisc {
                            common: QdiscCommon {
                                device: device.clone(),
                                handle: *handle,
                                parent: None,
                            },
                            spec: QdiscSpec::Tbf {
                                rate: *rate,
                                buffer: *buffer,
                                limit: *limit,
                                burst: *burst,
                            },
                        },
                    )
                    .await
            }
            Event::PrioQdiscCreated {
                device,
                handle,
                bands,
                priomap,
            } => {
                self.adapter
                    .add_qdisc(
                        ctx,
                        &Qdisc {
                            common: QdiscCommon {
                                device: device.clone(),
                                handle: *handle,
                                parent: None,
                            },
                            spec: QdiscSpec::Prio {
                                bands: *bands,
                                priomap: *priomap,
                            },
                        },
                    )
                    .await
            }
            Event::FqCodelQdiscCreated {
                device,
                handle,
                limit,
                flows,
                target,
                interval,
                quantum,
                ecn,
            } => {
                self.adapter
                    .add_qdisc(
                        ctx,
                        &Qdisc {
                            common: QdiscCommon {
                                device: device.clone(),
                                handle: *handle,
                                parent: None,
                            },
                            spec: QdiscSpec::FqCodel {
                                limit: *limit,
                                flows: *flows,
                                target: *target,
                                interval: *interval,
                                quantum: *quantum,
                                ecn: *ecn,
                            },
                        },
                    )
                    .await
            }
            Event::HtbClassCreated {
                device,
                parent,
                handle,
                name,
                rate,
                ceil,
                burst,
                cburst,
            } => {
                self.adapter
                    .add_class(
                        ctx,
                        &HtbClass {
                            device: device.clone(),
                            parent: *parent,
                            handle: *handle,
                            name: name.clone(),
                            rate: *rate,
                            ceil: (*ceil).max(*rate),
                            burst: *burst,
                            cburst: *cburst,
                            priority: None,
                        },
                    )
                    .await
            }
            Event::FilterCreated {
                device,
                parent,
                priority,
                handle,
                flow_id,
                link_protocol,
                matches,
            } => {
                self.adapter
                    .add_filter(
                        ctx,
                        &Filter {
                            device: device.clone(),
                            parent: *parent,
                            priority: *priority,
                            handle: *handle,
                            flow_id: *flow_id,
                            link_protocol: *link_protocol,
                            matches: matches.clone(),
                        },
                    )
                    .await
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(AdapterError::AlreadyExists) => {
                debug!(
                    event_type = event.type_tag(),
                    device = %event.device(),
                    "object already installed, treating as success"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl EventSubscriber for EventApplier {
    fn name(&self) -> &'static str {
        "netlink-applier"
    }

    async fn on_event(&self, record: &EventRecord) -> Result<(), Error> {
        // Post-commit application is never cancelled: the state change is
        // already durable.
        self.apply(&OpContext::new(), &record.event).await
    }
}
