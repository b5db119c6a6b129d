//! Service wiring: store, buses, projection and applier assembled into
//! one control plane.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::adapter::{EventApplier, MockAdapter, TcAdapter};
use crate::bus::EventBus;
use crate::command::CommandBus;
use crate::context::OpContext;
use crate::domain::DeviceName;
use crate::error::Result;
use crate::projection::ConfigurationProjection;
use crate::query::QueryBus;
use crate::store::{EventStore, InMemoryEventStore};

/// The assembled control plane.
///
/// Owns the command bus (write side), the query bus (read side), and the
/// two standing event subscribers: the configuration projection and the
/// netlink applier. Construction wires everything; injection of the store
/// and adapter keeps tests hermetic.
pub struct TrafficControlService {
    store: Arc<dyn EventStore>,
    adapter: Arc<dyn TcAdapter>,
    event_bus: Arc<EventBus>,
    projection: Arc<ConfigurationProjection>,
    applier: Arc<EventApplier>,
    commands: CommandBus,
    queries: QueryBus,
}

impl TrafficControlService {
    /// Wire a service around the given store and adapter.
    pub fn new(store: Arc<dyn EventStore>, adapter: Arc<dyn TcAdapter>) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::new());
        let projection = Arc::new(ConfigurationProjection::new());
        let applier = Arc::new(EventApplier::new(adapter.clone()));

        // Projection first: the read model reflects a commit even when the
        // kernel install fails afterwards.
        for tag in crate::domain::Event::ALL_TYPE_TAGS {
            event_bus.subscribe(tag, projection.clone());
        }
        event_bus.subscribe_all(applier.clone());

        let commands = CommandBus::new(store.clone(), event_bus.clone());
        let queries = QueryBus::new(projection.clone(), adapter.clone());

        Arc::new(Self {
            store,
            adapter,
            event_bus,
            projection,
            applier,
            commands,
            queries,
        })
    }

    /// A fully in-memory service: memory store plus mock adapter. The
    /// default for tests and non-privileged sandboxes.
    pub fn in_memory() -> Arc<Self> {
        Self::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(MockAdapter::new()),
        )
    }

    /// The write side.
    pub fn commands(&self) -> &CommandBus {
        &self.commands
    }

    /// The read side.
    pub fn queries(&self) -> &QueryBus {
        &self.queries
    }

    /// The event store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The kernel adapter.
    pub fn adapter(&self) -> &Arc<dyn TcAdapter> {
        &self.adapter
    }

    /// The event bus, for additional subscribers.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// The configuration projection.
    pub fn projection(&self) -> &Arc<ConfigurationProjection> {
        &self.projection
    }

    /// Rebuild the projection from the full event log. Used on startup
    /// and for query-side reconciliation.
    pub async fn rebuild_projection(&self) -> Result<()> {
        let records = self.store.load_all().await?;
        info!(events = records.len(), "rebuilding projection");
        self.projection.rebuild(&records);
        Ok(())
    }

    /// Re-drive a device's event log into the adapter.
    ///
    /// Installation is idempotent (`AlreadyExists` counts as success), so
    /// this reconciles a device after the kernel lost state or a previous
    /// apply failed partway.
    #[instrument(skip(self, ctx))]
    pub async fn reapply(&self, ctx: &OpContext, device: &DeviceName) -> Result<()> {
        let records = self.store.load(device.as_str()).await?;
        info!(device = %device, events = records.len(), "re-driving event log");
        for record in &records {
            ctx.check()?;
            self.applier.apply(ctx, &record.event).await?;
        }
        Ok(())
    }
}
