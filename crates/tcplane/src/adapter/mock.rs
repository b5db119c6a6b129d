//! In-memory TC adapter.
//!
//! Mirrors the kernel's bookkeeping closely enough for meaningful tests:
//! duplicate installs fail with `AlreadyExists`, classes demand an
//! existing parent, filters demand an existing target class. Counters are
//! zero unless a test injects them.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    AdapterError, AdapterResult, ClassInfo, FilterInfo, QdiscInfo, TcAdapter, TrafficCounters,
    classifier_kind,
};
use crate::context::OpContext;
use crate::domain::{DeviceName, Filter, FilterPriority, Handle, HtbClass, Qdisc};

#[derive(Debug, Clone)]
struct MockQdisc {
    kind: String,
    stats: TrafficCounters,
}

#[derive(Debug, Clone)]
struct MockClass {
    parent: Handle,
    kind: String,
    stats: TrafficCounters,
}

#[derive(Debug, Clone)]
struct MockFilter {
    kind: String,
    flow_id: Handle,
}

#[derive(Debug, Default)]
struct DeviceTables {
    qdiscs: BTreeMap<Handle, MockQdisc>,
    classes: BTreeMap<Handle, MockClass>,
    filters: BTreeMap<(Handle, u16, Handle), MockFilter>,
}

/// TC adapter holding per-device tables in memory.
#[derive(Debug, Default)]
pub struct MockAdapter {
    devices: Mutex<HashMap<String, DeviceTables>>,
    /// When set, operations against other devices fail with
    /// `DeviceNotFound`. Unset accepts any device.
    known_devices: Option<HashSet<String>>,
}

impl MockAdapter {
    /// An adapter accepting any device name.
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter that only knows the given devices.
    pub fn with_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: Mutex::new(HashMap::new()),
            known_devices: Some(devices.into_iter().map(Into::into).collect()),
        }
    }

    /// Inject counters for a qdisc, for statistics tests.
    pub fn set_qdisc_counters(&self, device: &str, handle: Handle, stats: TrafficCounters) {
        let mut devices = self.devices.lock();
        if let Some(qdisc) = devices
            .get_mut(device)
            .and_then(|tables| tables.qdiscs.get_mut(&handle))
        {
            qdisc.stats = stats;
        }
    }

    /// Inject counters for a class, for statistics tests.
    pub fn set_class_counters(&self, device: &str, handle: Handle, stats: TrafficCounters) {
        let mut devices = self.devices.lock();
        if let Some(class) = devices
            .get_mut(device)
            .and_then(|tables| tables.classes.get_mut(&handle))
        {
            class.stats = stats;
        }
    }

    fn check_device(&self, device: &DeviceName) -> AdapterResult<()> {
        if let Some(known) = &self.known_devices
            && !known.contains(device.as_str())
        {
            return Err(AdapterError::DeviceNotFound(device.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TcAdapter for MockAdapter {
    async fn add_qdisc(&self, ctx: &OpContext, qdisc: &Qdisc) -> AdapterResult<()> {
        check_ctx(ctx)?;
        self.check_device(&qdisc.common.device)?;

        let mut devices = self.devices.lock();
        let tables = devices
            .entry(qdisc.common.device.to_string())
            .or_default();
        if tables.qdiscs.contains_key(&qdisc.common.handle) {
            return Err(AdapterError::AlreadyExists);
        }
        debug!(
            device = %qdisc.common.device,
            handle = %qdisc.common.handle,
            kind = qdisc.kind(),
            "mock: add qdisc"
        );
        tables.qdiscs.insert(
            qdisc.common.handle,
            MockQdisc {
                kind: qdisc.kind().to_string(),
                stats: TrafficCounters::default(),
            },
        );
        Ok(())
    }

    async fn add_class(&self, ctx: &OpContext, class: &HtbClass) -> AdapterResult<()> {
        check_ctx(ctx)?;
        self.check_device(&class.device)?;

        let mut devices = self.devices.lock();
        let tables = devices.entry(class.device.to_string()).or_default();
        let parent_exists = tables.qdiscs.contains_key(&class.parent)
            || tables.classes.contains_key(&class.parent);
        if !parent_exists {
            return Err(AdapterError::KernelRejected(format!(
                "unknown parent {}",
                class.parent
            )));
        }
        if tables.classes.contains_key(&class.handle) {
            return Err(AdapterError::AlreadyExists);
        }
        debug!(device = %class.device, handle = %class.handle, "mock: add class");
        tables.classes.insert(
            class.handle,
            MockClass {
                parent: class.parent,
                kind: "htb".to_string(),
                stats: TrafficCounters::default(),
            },
        );
        Ok(())
    }

    async fn add_filter(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<()> {
        check_ctx(ctx)?;
        self.check_device(&filter.device)?;
        let kind = classifier_kind(filter)?;

        let mut devices = self.devices.lock();
        let tables = devices.entry(filter.device.to_string()).or_default();
        if !tables.qdiscs.contains_key(&filter.parent) {
            return Err(AdapterError::KernelRejected(format!(
                "unknown parent {}",
                filter.parent
            )));
        }
        if !tables.classes.contains_key(&filter.flow_id) {
            return Err(AdapterError::KernelRejected(format!(
                "unknown class {}",
                filter.flow_id
            )));
        }
        let key = (filter.parent, filter.priority.value(), filter.handle);
        if tables.filters.contains_key(&key) {
            return Err(AdapterError::AlreadyExists);
        }
        debug!(
            device = %filter.device,
            priority = filter.priority.value(),
            kind,
            "mock: add filter"
        );
        tables.filters.insert(
            key,
            MockFilter {
                kind: kind.to_string(),
                flow_id: filter.flow_id,
            },
        );
        Ok(())
    }

    async fn delete_qdisc(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        handle: Handle,
    ) -> AdapterResult<()> {
        check_ctx(ctx)?;
        self.check_device(device)?;

        let mut devices = self.devices.lock();
        let tables = devices
            .get_mut(device.as_str())
            .ok_or_else(|| AdapterError::KernelRejected(format!("no qdisc {handle}")))?;
        if tables.qdiscs.remove(&handle).is_none() {
            return Err(AdapterError::KernelRejected(format!("no qdisc {handle}")));
        }
        // The kernel drops the subtree with the qdisc.
        tables.classes.clear();
        tables.filters.clear();
        Ok(())
    }

    async fn delete_class(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        handle: Handle,
    ) -> AdapterResult<()> {
        check_ctx(ctx)?;
        self.check_device(device)?;

        let mut devices = self.devices.lock();
        let removed = devices
            .get_mut(device.as_str())
            .and_then(|tables| tables.classes.remove(&handle));
        if removed.is_none() {
            return Err(AdapterError::KernelRejected(format!("no class {handle}")));
        }
        Ok(())
    }

    async fn delete_filter(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
        parent: Handle,
        priority: FilterPriority,
        handle: Handle,
    ) -> AdapterResult<()> {
        check_ctx(ctx)?;
        self.check_device(device)?;

        let mut devices = self.devices.lock();
        let removed = devices
            .get_mut(device.as_str())
            .and_then(|tables| tables.filters.remove(&(parent, priority.value(), handle)));
        if removed.is_none() {
            return Err(AdapterError::KernelRejected(format!(
                "no filter {parent}#{priority}#{handle}"
            )));
        }
        Ok(())
    }

    async fn get_qdiscs(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<QdiscInfo>> {
        check_ctx(ctx)?;
        self.check_device(device)?;

        Ok(self
            .devices
            .lock()
            .get(device.as_str())
            .map(|tables| {
                tables
                    .qdiscs
                    .iter()
                    .map(|(handle, qdisc)| QdiscInfo {
                        handle: *handle,
                        kind: qdisc.kind.clone(),
                        stats: qdisc.stats,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_classes(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<ClassInfo>> {
        check_ctx(ctx)?;
        self.check_device(device)?;

        Ok(self
            .devices
            .lock()
            .get(device.as_str())
            .map(|tables| {
                tables
                    .classes
                    .iter()
                    .map(|(handle, class)| ClassInfo {
                        handle: *handle,
                        parent: class.parent,
                        kind: class.kind.clone(),
                        stats: class.stats,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_filters(
        &self,
        ctx: &OpContext,
        device: &DeviceName,
    ) -> AdapterResult<Vec<FilterInfo>> {
        check_ctx(ctx)?;
        self.check_device(device)?;

        Ok(self
            .devices
            .lock()
            .get(device.as_str())
            .map(|tables| {
                tables
                    .filters
                    .iter()
                    .map(|((parent, priority, _handle), filter)| FilterInfo {
                        parent: *parent,
                        priority: *priority,
                        kind: filter.kind.clone(),
                        flow_id: Some(filter.flow_id),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn check_ctx(ctx: &OpContext) -> AdapterResult<()> {
    if ctx.is_cancelled() {
        return Err(AdapterError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Bandwidth, LinkProtocol, Match, QdiscCommon, QdiscSpec};

    fn device() -> DeviceName {
        DeviceName::parse("eth0").unwrap()
    }

    fn htb_qdisc() -> Qdisc {
        Qdisc {
            common: QdiscCommon {
                device: device(),
                handle: Handle::ROOT,
                parent: None,
            },
            spec: QdiscSpec::Htb {
                default_class: Handle::new(1, 999),
                r2q: 10,
            },
        }
    }

    fn class(minor: u16) -> HtbClass {
        HtbClass {
            device: device(),
            parent: Handle::ROOT,
            handle: Handle::new(1, minor),
            name: format!("class-{minor}"),
            rate: Bandwidth::from_mbps(10),
            ceil: Bandwidth::from_mbps(20),
            burst: 12_500,
            cburst: 25_000,
            priority: None,
        }
    }

    fn filter(priority: u16, matches: Vec<Match>) -> Filter {
        Filter {
            device: device(),
            parent: Handle::ROOT,
            priority: FilterPriority::new(priority).unwrap(),
            handle: Handle::new(0, priority),
            flow_id: Handle::new(1, 14),
            link_protocol: LinkProtocol::Ip,
            matches,
        }
    }

    #[tokio::test]
    async fn test_install_tree_and_dump() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter.add_filter(&ctx, &filter(100, vec![])).await.unwrap();

        let qdiscs = adapter.get_qdiscs(&ctx, &device()).await.unwrap();
        assert_eq!(qdiscs.len(), 1);
        assert_eq!(qdiscs[0].kind, "htb");

        let classes = adapter.get_classes(&ctx, &device()).await.unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].handle, Handle::new(1, 14));

        let filters = adapter.get_filters(&ctx, &device()).await.unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].kind, "u32");
    }

    #[tokio::test]
    async fn test_duplicate_qdisc_already_exists() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        let err = adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap_err();
        assert!(matches!(err, AdapterError::AlreadyExists));
    }

    #[tokio::test]
    async fn test_class_without_parent_rejected() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        let err = adapter.add_class(&ctx, &class(14)).await.unwrap_err();
        assert!(matches!(err, AdapterError::KernelRejected(_)));
    }

    #[tokio::test]
    async fn test_filter_without_class_rejected() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        let err = adapter
            .add_filter(&ctx, &filter(100, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::KernelRejected(_)));
    }

    #[tokio::test]
    async fn test_mark_filter_records_fw_kind() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter
            .add_filter(&ctx, &filter(100, vec![Match::mark(0x100)]))
            .await
            .unwrap();

        let filters = adapter.get_filters(&ctx, &device()).await.unwrap();
        assert_eq!(filters[0].kind, "fw");
        assert_eq!(filters[0].flow_id, Some(Handle::new(1, 14)));
    }

    #[tokio::test]
    async fn test_unknown_device_when_restricted() {
        let adapter = MockAdapter::with_devices(["eth0"]);
        let ctx = OpContext::new();

        let other = DeviceName::parse("wlan0").unwrap();
        let err = adapter.get_qdiscs(&ctx, &other).await.unwrap_err();
        assert!(matches!(err, AdapterError::DeviceNotFound(_)));

        assert!(adapter.get_qdiscs(&ctx, &device()).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_qdisc_cascades() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter.add_filter(&ctx, &filter(100, vec![])).await.unwrap();

        adapter
            .delete_qdisc(&ctx, &device(), Handle::ROOT)
            .await
            .unwrap();
        assert!(adapter.get_qdiscs(&ctx, &device()).await.unwrap().is_empty());
        assert!(adapter.get_classes(&ctx, &device()).await.unwrap().is_empty());
        assert!(adapter.get_filters(&ctx, &device()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_class_removes_only_that_class() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter.add_class(&ctx, &class(15)).await.unwrap();

        adapter
            .delete_class(&ctx, &device(), Handle::new(1, 14))
            .await
            .unwrap();

        let classes = adapter.get_classes(&ctx, &device()).await.unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].handle, Handle::new(1, 15));
        // The qdisc is untouched.
        assert_eq!(adapter.get_qdiscs(&ctx, &device()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_class_rejected() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        let err = adapter
            .delete_class(&ctx, &device(), Handle::new(1, 14))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::KernelRejected(_)));

        // Deleting twice hits the same arm.
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter
            .delete_class(&ctx, &device(), Handle::new(1, 14))
            .await
            .unwrap();
        let err = adapter
            .delete_class(&ctx, &device(), Handle::new(1, 14))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::KernelRejected(_)));
    }

    #[tokio::test]
    async fn test_delete_filter_removes_only_that_filter() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter.add_filter(&ctx, &filter(100, vec![])).await.unwrap();
        adapter
            .add_filter(&ctx, &filter(101, vec![Match::PortDestination(5432)]))
            .await
            .unwrap();

        adapter
            .delete_filter(
                &ctx,
                &device(),
                Handle::ROOT,
                FilterPriority::new(100).unwrap(),
                Handle::new(0, 100),
            )
            .await
            .unwrap();

        let filters = adapter.get_filters(&ctx, &device()).await.unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].priority, 101);
        // The class the filter steered to is untouched.
        assert_eq!(adapter.get_classes(&ctx, &device()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_filter_rejected() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter.add_filter(&ctx, &filter(100, vec![])).await.unwrap();

        // Same priority, different handle: no match on the full key.
        let err = adapter
            .delete_filter(
                &ctx,
                &device(),
                Handle::ROOT,
                FilterPriority::new(100).unwrap(),
                Handle::new(0, 101),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::KernelRejected(_)));

        let err = adapter
            .delete_filter(
                &ctx,
                &device(),
                Handle::ROOT,
                FilterPriority::new(77).unwrap(),
                Handle::new(0, 77),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::KernelRejected(_)));
    }

    #[tokio::test]
    async fn test_injected_counters_surface_in_dumps() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();

        adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap();
        adapter.add_class(&ctx, &class(14)).await.unwrap();
        adapter.set_class_counters(
            "eth0",
            Handle::new(1, 14),
            TrafficCounters {
                bytes: 4096,
                packets: 32,
                drops: 1,
                ..Default::default()
            },
        );

        let classes = adapter.get_classes(&ctx, &device()).await.unwrap();
        assert_eq!(classes[0].stats.bytes, 4096);
        assert_eq!(classes[0].stats.drops, 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let adapter = MockAdapter::new();
        let ctx = OpContext::new();
        ctx.cancel();

        let err = adapter.add_qdisc(&ctx, &htb_qdisc()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
    }
}
