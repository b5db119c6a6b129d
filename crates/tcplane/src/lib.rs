//! Event-sourced control plane for Linux traffic control.
//!
//! tcplane lets callers declare hierarchical bandwidth policies (root
//! qdiscs, HTB classes, and packet-classification filters) against named
//! network interfaces, then reconciles that intent with the kernel over
//! rtnetlink. Every accepted change is an immutable event; the event log
//! is the authoritative state, and both the queryable read model and the
//! kernel installation are derived from it.
//!
//! # Architecture
//!
//! Commands flow through a CQRS pipeline:
//!
//! ```text
//! Controller (fluent API)
//!   -> CommandBus -> handler -> TrafficControlAggregate (pure)
//!   -> EventStore (optimistic concurrency)
//!   -> EventBus -> ConfigurationProjection (read model)
//!              -> EventApplier -> TcAdapter (kernel via rtnetlink, or mock)
//! ```
//!
//! Queries go through [`query::QueryBus`], composing the projection with
//! live counters dumped from the adapter.
//!
//! # Example
//!
//! ```ignore
//! use tcplane::Controller;
//!
//! #[tokio::main]
//! async fn main() -> tcplane::Result<()> {
//!     // Defaults to an in-memory service with a mock adapter; use
//!     // Controller::with_service to drive a real kernel.
//!     let mut controller = Controller::new("eth0");
//!     controller.with_hard_limit_bandwidth("1Gbps");
//!     controller
//!         .create_traffic_class("database")
//!         .with_guaranteed_bandwidth("100Mbps")
//!         .with_soft_limit_bandwidth("200Mbps")
//!         .with_priority(4)
//!         .for_destination("192.168.1.10")
//!         .apply()
//!         .await?;
//!
//!     let stats = controller.get_statistics().await?;
//!     println!("{} qdiscs", stats.qdisc_stats.len());
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! Aggregates are ephemeral and pure; the store serializes commits per
//! device via optimistic concurrency. Two concurrent applies to the same
//! device race on the expected version: exactly one commits, the other
//! gets [`Error::ConcurrencyConflict`] and may retry (re-apply converges
//! because existing pieces are skipped). Different devices are fully
//! independent.

pub mod adapter;
pub mod api;
pub mod bus;
pub mod command;
pub mod context;
pub mod domain;
pub mod error;
pub mod projection;
pub mod query;
pub mod service;
pub mod store;

pub use adapter::{
    AdapterError, ClassInfo, FilterInfo, MockAdapter, NetlinkAdapter, QdiscInfo, TcAdapter,
    TrafficCounters,
};
pub use api::{Controller, TrafficClassBuilder};
pub use bus::{EventBus, EventSubscriber, SubscriberFailure};
pub use command::{Command, CommandBus, CommandOutcome, MatchArg};
pub use context::OpContext;
pub use domain::{
    Bandwidth, Cidr, DeviceName, DomainError, Event, EventRecord, Filter, FilterPriority, Handle,
    HtbClass, LinkProtocol, Match, Priority, Qdisc, QdiscCommon, QdiscSpec,
    TrafficControlAggregate, TransportProtocol,
};
pub use error::{Error, Result};
pub use projection::{ConfigurationProjection, ConfigurationView};
pub use query::{ClassStatistics, DeviceStatistics, QdiscStatistics, QueryBus};
pub use service::TrafficControlService;
pub use store::{EventStore, InMemoryEventStore, StoreError};
