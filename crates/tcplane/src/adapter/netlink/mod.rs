//! Real rtnetlink adapter.
//!
//! Talks to the kernel's TC subsystem over a NETLINK_ROUTE socket:
//! RTM_NEWQDISC/RTM_NEWTCLASS/RTM_NEWTFILTER for installation,
//! RTM_DEL* for removal, RTM_GET* dumps for statistics. Requires
//! CAP_NET_ADMIN for mutations.

mod attr;
mod builder;
mod message;
mod options;
mod parse;
mod socket;
mod tcmsg;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use self::builder::MessageBuilder;
use self::message::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, RTM_DELQDISC, RTM_DELTCLASS,
    RTM_DELTFILTER, RTM_GETQDISC, RTM_GETTCLASS, RTM_GETTFILTER, RTM_NEWQDISC, RTM_NEWTCLASS,
    RTM_NEWTFILTER,
};
use self::options::{
    u32_filter_handle, write_class_options, write_fw_options, write_qdisc_options,
    write_u32_options,
};
use self::parse::TcDumpMessage;
use self::socket::NetlinkConnection;
use self::tcmsg::{TCA_KIND, TCA_OPTIONS, TcMsg, filter_info, filter_priority, tc_handle};
use super::{
    AdapterError, AdapterResult, ClassInfo, FilterInfo, QdiscInfo, TcAdapter, classifier_kind,
};
use crate::context::OpContext;
use crate::domain::{DeviceName, Filter, FilterPriority, Handle, HtbClass, Match, Qdisc};

/// TC adapter backed by a real rtnetlink socket.
///
/// Netlink transactions are serialized behind a mutex; the socket matches
/// responses by sequence number, one request in flight at a time.
pub struct NetlinkAdapter {
    conn: Mutex<NetlinkConnection>,
}

impl NetlinkAdapter {
    /// Open a NETLINK_ROUTE socket.
    pub fn new() -> AdapterResult<Self> {
        Ok(Self {
            conn: Mutex::new(NetlinkConnection::new()?),
        })
    }

    fn ifindex(device: &DeviceName) -> AdapterResult<i32> {
        let path = format!("/sys/class/net/{device}/ifindex");
        let content = std::fs::read_to_string(&path)
            .map_err(|_| AdapterError::DeviceNotFound(device.to_string()))?;
        content
            .trim()
            .parse()
            .map_err(|_| AdapterError::DeviceNotFound(device.to_string()))
    }

    fn check_ctx(ctx: &OpContext) -> AdapterResult<()> {
        if ctx.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        Ok(())
    }

    async fn dump(&self, msg_type: u16, tcm: TcMsg, operation: &str) -> AdapterResult<Vec<TcDumpMessage>> {
        let mut builder = MessageBuilder::new(msg_type, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&tcm);
        let responses = self.conn.lock().await.dump(builder, operation).await?;
        Ok(responses
            .iter()
            .filter_map(|response| TcDumpMessage::parse(response))
            .collect())
    }
}

#[async_trait]
impl TcAdapter for NetlinkAdapter {
    #[instrument(skip(self, ctx, qdisc), fields(device = %qdisc.common.device, kind = qdisc.kind()))]
    async fn add_qdisc(&self, ctx: &OpContext, qdisc: &Qdisc) -> AdapterResult<()> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(&qdisc.common.device)?;

        let parent = qdisc
            .common
            .parent
            .map(|p| p.as_u32())
            .unwrap_or(tc_handle::ROOT);
        let tcm = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(qdisc.common.handle.as_u32())
            .with_parent(parent);

        let mut builder = MessageBuilder::new(
            RTM_NEWQDISC,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        builder.append(&tcm);
        builder.append_attr_str(TCA_KIND, qdisc.kind());
        write_qdisc_options(&mut builder, &qdisc.spec);

        debug!(handle = %qdisc.common.handle, "installing qdisc");
        self.conn
            .lock()
            .await
            .request_ack(builder, "add qdisc")
            .await
    }

    #[instrument(skip(self, ctx, class), fields(device = %class.device, handle = %class.handle))]
    async fn add_class(&self, ctx: &OpContext, class: &HtbClass) -> AdapterResult<()> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(&class.device)?;

        let tcm = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(class.handle.as_u32())
            .with_parent(class.parent.as_u32());

        let mut builder =
            MessageBuilder::new(RTM_NEWTCLASS, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE);
        builder.append(&tcm);
        builder.append_attr_str(TCA_KIND, "htb");
        write_class_options(&mut builder, class);

        debug!(rate = class.rate.bits_per_second(), "installing class");
        self.conn
            .lock()
            .await
            .request_ack(builder, "add class")
            .await
    }

    #[instrument(skip(self, ctx, filter), fields(device = %filter.device, priority = filter.priority.value()))]
    async fn add_filter(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<()> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(&filter.device)?;
        let kind = classifier_kind(filter)?;

        // fw filters carry their mark value in tcm_handle; u32 filters a
        // node in the 0x800 hash table.
        let handle = match kind {
            "fw" => match filter.matches.first() {
                Some(Match::Mark { value, .. }) => *value,
                _ => {
                    return Err(AdapterError::KernelRejected(
                        "fw classifier needs a mark match".to_string(),
                    ));
                }
            },
            _ => u32_filter_handle(filter.handle.minor()),
        };

        let info = filter_info(filter.priority.value(), filter.link_protocol.ethertype());
        let tcm = TcMsg::new()
            .with_ifindex(ifindex)
            .with_parent(filter.parent.as_u32())
            .with_handle(handle)
            .with_info(info);

        let mut builder =
            MessageBuilder::new(RTM_NEWTFILTER, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE);
        builder.append(&tcm);
        builder.append_attr_str(TCA_KIND, kind);
        let options = builder.nest_start(TCA_OPTIONS);
        match kind {
            "fw" => write_fw_options(&mut builder, filter)?,
            _ => write_u32_options(&mut builder, filter)?,
        }
        builder.nest_end(options);

        debug!(kind, "installing filter");
        self.conn
            .lock()
            .await
            .request_ack(builder, "add filter")
            .await
    }

    async fn delete_qdisc(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        handle: Handle,
    ) -> AdapterResult<()> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(device)?;

        let tcm = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(handle.as_u32())
            .with_parent(tc_handle::ROOT);
        let mut builder = MessageBuilder::new(RTM_DELQDISC, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&tcm);

        self.conn
            .lock()
            .await
            .request_ack(builder, "delete qdisc")
            .await
    }

    async fn delete_class(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        handle: Handle,
    ) -> AdapterResult<()> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(device)?;

        let tcm = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(handle.as_u32());
        let mut builder = MessageBuilder::new(RTM_DELTCLASS, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&tcm);

        self.conn
            .lock()
            .await
            .request_ack(builder, "delete class")
            .await
    }

    async fn delete_filter(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        parent: Handle,
        priority: FilterPriority,
        handle: Handle,
    ) -> AdapterResult<()> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(device)?;

        let tcm = TcMsg::new()
            .with_ifindex(ifindex)
            .with_handle(u32_filter_handle(handle.minor()))
            .with_parent(parent.as_u32())
            .with_info(filter_info(priority.value(), 0x0800));
        let mut builder = MessageBuilder::new(RTM_DELTFILTER, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&tcm);

        self.conn
            .lock()
            .await
            .request_ack(builder, "delete filter")
            .await
    }

    async fn get_qdiscs(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<QdiscInfo>> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(device)?;

        let tcm = TcMsg::new().with_ifindex(ifindex);
        let dumped = self.dump(RTM_GETQDISC, tcm, "get qdiscs").await?;
        Ok(dumped
            .into_iter()
            .filter(|msg| msg.header.tcm_ifindex == ifindex)
            .map(|msg| QdiscInfo {
                handle: Handle::from_u32(msg.header.tcm_handle),
                kind: msg.kind.unwrap_or_default(),
                stats: msg.stats,
            })
            .collect())
    }

    async fn get_classes(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<ClassInfo>> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(device)?;

        let tcm = TcMsg::new().with_ifindex(ifindex);
        let dumped = self.dump(RTM_GETTCLASS, tcm, "get classes").await?;
        Ok(dumped
            .into_iter()
            .filter(|msg| msg.header.tcm_ifindex == ifindex)
            .map(|msg| ClassInfo {
                handle: Handle::from_u32(msg.header.tcm_handle),
                parent: Handle::from_u32(msg.header.tcm_parent),
                kind: msg.kind.unwrap_or_default(),
                stats: msg.stats,
            })
            .collect())
    }

    async fn get_filters(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<FilterInfo>> {
        Self::check_ctx(ctx)?;
        let ifindex = Self::ifindex(device)?;

        let tcm = TcMsg::new()
            .with_ifindex(ifindex)
            .with_parent(tc_handle::ROOT);
        let dumped = self.dump(RTM_GETTFILTER, tcm, "get filters").await?;
        Ok(dumped
            .into_iter()
            .filter(|msg| msg.header.tcm_ifindex == ifindex && msg.kind.is_some())
            .map(|msg| FilterInfo {
                parent: Handle::from_u32(msg.header.tcm_parent),
                priority: filter_priority(msg.header.tcm_info),
                kind: msg.kind.unwrap_or_default(),
                flow_id: None,
            })
            .collect())
    }
}
