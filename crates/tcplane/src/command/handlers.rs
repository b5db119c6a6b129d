//! Command handlers: one per command type.
//!
//! A handler is pure. It validates the command's structure, parses raw
//! input into value objects, and invokes the matching aggregate operation.
//! Loading, saving and publishing belong to the [`CommandBus`]; keeping
//! handlers free of I/O keeps them trivially testable.
//!
//! [`CommandBus`]: super::CommandBus

use std::sync::Arc;

use super::{Command, MatchArg};
use crate::domain::{
    Bandwidth, Cidr, DomainError, FilterPriority, Handle, Match, TrafficControlAggregate,
};
use crate::error::{Error, Result};

/// A pure command handler: parse, validate, invoke the aggregate.
pub trait CommandHandler: Send + Sync {
    /// The command kind this handler accepts.
    fn kind(&self) -> &'static str;

    /// Apply the command to the aggregate, emitting pending events.
    fn handle(&self, cmd: &Command, aggregate: &mut TrafficControlAggregate) -> Result<()>;
}

/// The full set of built-in handlers, one per command type.
pub fn default_handlers() -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(CreateHtbQdiscHandler),
        Arc::new(CreateTbfQdiscHandler),
        Arc::new(CreatePrioQdiscHandler),
        Arc::new(CreateFqCodelQdiscHandler),
        Arc::new(CreateHtbClassHandler),
        Arc::new(CreateFilterHandler),
    ]
}

fn wrong_variant(handler: &'static str, cmd: &Command) -> Error {
    // Registration maps kinds to handlers, so a mismatch here is a wiring
    // bug, not caller input.
    Error::UnknownCommand(format!("{handler} received {}", cmd.kind()))
}

struct CreateHtbQdiscHandler;

impl CommandHandler for CreateHtbQdiscHandler {
    fn kind(&self) -> &'static str {
        "create_htb_qdisc"
    }

    fn handle(&self, cmd: &Command, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        let Command::CreateHtbQdisc {
            handle,
            default_class,
            r2q,
            ..
        } = cmd
        else {
            return Err(wrong_variant("CreateHtbQdiscHandler", cmd));
        };

        let handle = Handle::parse(handle)?;
        let default_class = Handle::parse(default_class)?;
        let r2q = r2q.unwrap_or(crate::domain::DEFAULT_R2Q);
        aggregate.create_htb_qdisc(handle, default_class, r2q)?;
        Ok(())
    }
}

struct CreateTbfQdiscHandler;

impl CommandHandler for CreateTbfQdiscHandler {
    fn kind(&self) -> &'static str {
        "create_tbf_qdisc"
    }

    fn handle(&self, cmd: &Command, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        let Command::CreateTbfQdisc {
            handle,
            rate,
            buffer,
            limit,
            burst,
            ..
        } = cmd
        else {
            return Err(wrong_variant("CreateTbfQdiscHandler", cmd));
        };

        let handle = Handle::parse(handle)?;
        let rate = Bandwidth::parse(rate)?;
        aggregate.create_tbf_qdisc(handle, rate, *buffer, *limit, *burst)?;
        Ok(())
    }
}

struct CreatePrioQdiscHandler;

impl CommandHandler for CreatePrioQdiscHandler {
    fn kind(&self) -> &'static str {
        "create_prio_qdisc"
    }

    fn handle(&self, cmd: &Command, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        let Command::CreatePrioQdisc {
            handle,
            bands,
            priomap,
            ..
        } = cmd
        else {
            return Err(wrong_variant("CreatePrioQdiscHandler", cmd));
        };

        let handle = Handle::parse(handle)?;
        let priomap: [u8; 16] = priomap.as_slice().try_into().map_err(|_| {
            DomainError::rejected("priomap", format!("needs 16 entries, got {}", priomap.len()))
        })?;
        aggregate.create_prio_qdisc(handle, *bands, priomap)?;
        Ok(())
    }
}

struct CreateFqCodelQdiscHandler;

impl CommandHandler for CreateFqCodelQdiscHandler {
    fn kind(&self) -> &'static str {
        "create_fq_codel_qdisc"
    }

    fn handle(&self, cmd: &Command, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        let Command::CreateFqCodelQdisc {
            handle,
            limit,
            flows,
            target,
            interval,
            quantum,
            ecn,
            ..
        } = cmd
        else {
            return Err(wrong_variant("CreateFqCodelQdiscHandler", cmd));
        };

        let handle = Handle::parse(handle)?;
        aggregate.create_fq_codel_qdisc(
            handle, *limit, *flows, *target, *interval, *quantum, *ecn,
        )?;
        Ok(())
    }
}

struct CreateHtbClassHandler;

impl CommandHandler for CreateHtbClassHandler {
    fn kind(&self) -> &'static str {
        "create_htb_class"
    }

    fn handle(&self, cmd: &Command, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        let Command::CreateHtbClass {
            parent,
            handle,
            name,
            rate,
            ceil,
            ..
        } = cmd
        else {
            return Err(wrong_variant("CreateHtbClassHandler", cmd));
        };

        if name.is_empty() {
            return Err(DomainError::rejected("name", "must not be empty").into());
        }
        let parent = Handle::parse(parent)?;
        let handle = Handle::parse(handle)?;
        let rate = Bandwidth::parse(rate)?;
        let ceil = match ceil {
            Some(ceil) => Bandwidth::parse(ceil)?,
            None => Bandwidth::ZERO, // the aggregate defaults ceil to rate
        };
        aggregate.create_htb_class(parent, handle, name, rate, ceil)?;
        Ok(())
    }
}

struct CreateFilterHandler;

impl CommandHandler for CreateFilterHandler {
    fn kind(&self) -> &'static str {
        "create_filter"
    }

    fn handle(&self, cmd: &Command, aggregate: &mut TrafficControlAggregate) -> Result<()> {
        let Command::CreateFilter {
            parent,
            priority,
            handle,
            flow_id,
            link_protocol,
            matches,
            ..
        } = cmd
        else {
            return Err(wrong_variant("CreateFilterHandler", cmd));
        };

        let parent = Handle::parse(parent)?;
        let priority = FilterPriority::new(*priority)?;
        let handle = Handle::parse(handle)?;
        let flow_id = Handle::parse(flow_id)?;
        let matches = matches
            .iter()
            .map(parse_match)
            .collect::<Result<Vec<_>>>()?;
        aggregate.create_filter(parent, priority, handle, flow_id, *link_protocol, matches)?;
        Ok(())
    }
}

fn parse_match(arg: &MatchArg) -> Result<Match> {
    Ok(match arg {
        MatchArg::IpSource(cidr) => Match::IpSource(Cidr::parse(cidr)?),
        MatchArg::IpDestination(cidr) => Match::IpDestination(Cidr::parse(cidr)?),
        MatchArg::PortSource(port) => Match::PortSource(*port),
        MatchArg::PortDestination(port) => Match::PortDestination(*port),
        MatchArg::Protocol(proto) => Match::Protocol(*proto),
        MatchArg::Mark { value, mask } => Match::Mark {
            value: *value,
            mask: mask.unwrap_or(u32::MAX),
        },
    })
}
