//! The command bus: typed dispatch plus the effectful pipeline.
//!
//! Handlers are registered by command kind at construction. The bus owns
//! the pipeline around them: check context, load and replay the aggregate,
//! run the handler arms, check context again, save under the expected
//! version, and publish the committed events. Cancellation after a
//! successful save does not suppress publication.
//!
//! `execute` commits one command; `execute_batch` folds several commands
//! over one aggregate load and commits them atomically, which is what
//! makes a whole policy apply a single optimistic-concurrency unit.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::handlers::{CommandHandler, default_handlers};
use super::Command;
use crate::bus::{EventBus, SubscriberFailure};
use crate::context::OpContext;
use crate::domain::{DeviceName, DomainError, EventRecord, TrafficControlAggregate};
use crate::error::{Error, Result};
use crate::store::EventStore;

/// The result of a committed command or batch.
#[derive(Debug)]
pub struct CommandOutcome {
    /// The aggregate written to.
    pub aggregate_id: String,
    /// The aggregate's version after the commit.
    pub version: u64,
    /// The committed records, in version order.
    pub records: Vec<EventRecord>,
    /// Post-commit subscriber failures; the commit itself stands.
    pub subscriber_failures: Vec<SubscriberFailure>,
}

/// Maps command kinds to handlers and drives the commit pipeline.
pub struct CommandBus {
    store: Arc<dyn EventStore>,
    event_bus: Arc<EventBus>,
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl CommandBus {
    /// A bus with the built-in handlers registered.
    pub fn new(store: Arc<dyn EventStore>, event_bus: Arc<EventBus>) -> Self {
        let mut bus = Self {
            store,
            event_bus,
            handlers: HashMap::new(),
        };
        for handler in default_handlers() {
            bus.register(handler);
        }
        bus
    }

    /// Register a handler; replaces any handler of the same kind.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Load and replay a device's aggregate.
    pub async fn load_aggregate(&self, device: &DeviceName) -> Result<TrafficControlAggregate> {
        let records = self.store.load(device.as_str()).await?;
        Ok(TrafficControlAggregate::replay(
            device.clone(),
            records.iter().map(|r| &r.event),
        ))
    }

    /// Execute one command: load, handle, save, publish.
    pub async fn execute(&self, ctx: &OpContext, cmd: Command) -> Result<CommandOutcome> {
        ctx.check()?;
        let device = DeviceName::parse(cmd.device())?;
        let mut aggregate = self.load_aggregate(&device).await?;
        self.commit(ctx, &mut aggregate, std::slice::from_ref(&cmd))
            .await
    }

    /// Execute several commands against one aggregate load, committing
    /// them as a single optimistic-concurrency unit.
    ///
    /// All commands must target the same device.
    pub async fn execute_batch(&self, ctx: &OpContext, cmds: &[Command]) -> Result<CommandOutcome> {
        ctx.check()?;
        let first = cmds
            .first()
            .ok_or_else(|| DomainError::rejected("commands", "batch is empty"))?;
        if let Some(other) = cmds.iter().find(|c| c.device() != first.device()) {
            return Err(DomainError::rejected(
                "device",
                format!(
                    "batch mixes devices {:?} and {:?}",
                    first.device(),
                    other.device()
                ),
            )
            .into());
        }

        let device = DeviceName::parse(first.device())?;
        let mut aggregate = self.load_aggregate(&device).await?;
        self.commit(ctx, &mut aggregate, cmds).await
    }

    /// Run handler arms against an already-loaded aggregate and commit its
    /// pending events under the version captured at load time.
    ///
    /// Exposed so the fluent builder can plan its command sequence against
    /// the same load it commits with; a concurrent writer then surfaces as
    /// `ConcurrencyConflict` rather than a spurious domain error.
    #[instrument(skip_all, fields(device = %aggregate.device(), commands = cmds.len()))]
    pub async fn commit(
        &self,
        ctx: &OpContext,
        aggregate: &mut TrafficControlAggregate,
        cmds: &[Command],
    ) -> Result<CommandOutcome> {
        for cmd in cmds {
            if cmd.device() != aggregate.device().as_str() {
                return Err(DomainError::rejected(
                    "device",
                    format!(
                        "command targets {:?}, aggregate is {:?}",
                        cmd.device(),
                        aggregate.device().as_str()
                    ),
                )
                .into());
            }
            let handler = self
                .handlers
                .get(cmd.kind())
                .ok_or_else(|| Error::UnknownCommand(cmd.kind().to_string()))?;
            handler.handle(cmd, aggregate)?;
        }

        // Last cancellation point: past here the commit goes through and
        // the events will be published regardless.
        ctx.check()?;

        let expected_version = aggregate.committed_version();
        let events = aggregate.take_pending();
        if events.is_empty() {
            return Ok(CommandOutcome {
                aggregate_id: aggregate.device().to_string(),
                version: expected_version,
                records: Vec::new(),
                subscriber_failures: Vec::new(),
            });
        }

        let records = self
            .store
            .save(aggregate.device().as_str(), events, expected_version)
            .await?;
        aggregate.mark_committed();

        debug!(
            device = %aggregate.device(),
            committed = records.len(),
            version = aggregate.version(),
            "committed events"
        );

        let subscriber_failures = self.event_bus.publish(&records).await;

        Ok(CommandOutcome {
            aggregate_id: aggregate.device().to_string(),
            version: aggregate.version(),
            records,
            subscriber_failures,
        })
    }
}
