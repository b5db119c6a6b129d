//! The TC domain model: value objects, entities, events and the
//! per-device aggregate.

pub mod aggregate;
pub mod bandwidth;
pub mod class;
pub mod device;
pub mod error;
pub mod event;
pub mod filter;
pub mod handle;
pub mod priority;
pub mod protocol;
pub mod qdisc;

pub use aggregate::TrafficControlAggregate;
pub use bandwidth::Bandwidth;
pub use class::{HtbClass, derive_burst};
pub use device::DeviceName;
pub use error::DomainError;
pub use event::{Event, EventRecord};
pub use filter::{Cidr, Filter, Match};
pub use handle::Handle;
pub use priority::{FilterPriority, Priority};
pub use protocol::{LinkProtocol, TransportProtocol};
pub use qdisc::{DEFAULT_R2Q, Qdisc, QdiscCommon, QdiscSpec};
