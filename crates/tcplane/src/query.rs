//! Query bus: the read side.
//!
//! Queries never mutate state. Configuration queries read the projection;
//! statistics queries compose the projection's names and handles with live
//! counters dumped from the adapter.

use std::sync::Arc;

use serde::Serialize;

use crate::adapter::{TcAdapter, TrafficCounters};
use crate::context::OpContext;
use crate::domain::{DeviceName, DomainError, Handle};
use crate::error::Result;
use crate::projection::{ConfigurationProjection, ConfigurationView};

/// Live statistics for one qdisc.
#[derive(Debug, Clone, Serialize)]
pub struct QdiscStatistics {
    /// Qdisc handle, formatted.
    pub handle: String,
    /// Kind string.
    pub kind: String,
    /// Counters from the kernel.
    pub stats: TrafficCounters,
}

/// Live statistics for one class.
#[derive(Debug, Clone, Serialize)]
pub struct ClassStatistics {
    /// Class handle, formatted.
    pub handle: String,
    /// Policy name, when the read model knows it.
    pub name: Option<String>,
    /// Counters from the kernel.
    pub stats: TrafficCounters,
}

/// Statistics for a whole device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatistics {
    /// Device name.
    pub device: String,
    /// Per-qdisc statistics.
    pub qdisc_stats: Vec<QdiscStatistics>,
    /// Per-class statistics.
    pub class_stats: Vec<ClassStatistics>,
}

/// Read-side entry point.
pub struct QueryBus {
    projection: Arc<ConfigurationProjection>,
    adapter: Arc<dyn TcAdapter>,
}

impl QueryBus {
    /// Wire the read side to its two sources.
    pub fn new(projection: Arc<ConfigurationProjection>, adapter: Arc<dyn TcAdapter>) -> Self {
        Self {
            projection,
            adapter,
        }
    }

    /// The projected configuration of a device.
    ///
    /// A device with no history yields an empty view at version 0.
    pub fn get_configuration(&self, device: &str) -> Result<ConfigurationView> {
        let device = DeviceName::parse(device)?;
        Ok(self.projection.view(device.as_str()))
    }

    /// Projection names and handles composed with live adapter counters.
    pub async fn get_device_statistics(
        &self,
        ctx: &OpContext,
        device: &str,
    ) -> Result<DeviceStatistics> {
        ctx.check()?;
        let device = DeviceName::parse(device)?;
        let view = self.projection.view(device.as_str());

        let qdiscs = self.adapter.get_qdiscs(ctx, &device).await?;
        ctx.check()?;
        let classes = self.adapter.get_classes(ctx, &device).await?;

        let qdisc_stats = qdiscs
            .into_iter()
            .map(|info| QdiscStatistics {
                handle: info.handle.to_string(),
                kind: info.kind,
                stats: info.stats,
            })
            .collect();

        let class_stats = classes
            .into_iter()
            .map(|info| {
                let handle = info.handle.to_string();
                let name = view.class(&handle).map(|c| c.name.clone());
                ClassStatistics {
                    handle,
                    name,
                    stats: info.stats,
                }
            })
            .collect();

        Ok(DeviceStatistics {
            device: device.to_string(),
            qdisc_stats,
            class_stats,
        })
    }

    /// Statistics for one qdisc, by handle.
    pub async fn get_qdisc_statistics(
        &self,
        ctx: &OpContext,
        device: &str,
        handle: &str,
    ) -> Result<QdiscStatistics> {
        ctx.check()?;
        let device = DeviceName::parse(device)?;
        let handle = Handle::parse(handle)?;

        let qdiscs = self.adapter.get_qdiscs(ctx, &device).await?;
        qdiscs
            .into_iter()
            .find(|info| info.handle == handle)
            .map(|info| QdiscStatistics {
                handle: info.handle.to_string(),
                kind: info.kind,
                stats: info.stats,
            })
            .ok_or_else(|| {
                DomainError::rejected("handle", format!("no qdisc {handle} on {device}")).into()
            })
    }

    /// Statistics for one class, by handle.
    pub async fn get_class_statistics(
        &self,
        ctx: &OpContext,
        device: &str,
        handle: &str,
    ) -> Result<ClassStatistics> {
        ctx.check()?;
        let device = DeviceName::parse(device)?;
        let handle = Handle::parse(handle)?;
        let view = self.projection.view(device.as_str());

        let classes = self.adapter.get_classes(ctx, &device).await?;
        classes
            .into_iter()
            .find(|info| info.handle == handle)
            .map(|info| {
                let handle = info.handle.to_string();
                let name = view.class(&handle).map(|c| c.name.clone());
                ClassStatistics {
                    handle,
                    name,
                    stats: info.stats,
                }
            })
            .ok_or_else(|| {
                DomainError::rejected("handle", format!("no class {handle} on {device}")).into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::adapter::MockAdapter;
    use crate::domain::{
        Bandwidth, Event, EventRecord, HtbClass, Qdisc, QdiscCommon, QdiscSpec,
    };

    async fn fixture() -> (QueryBus, Arc<MockAdapter>) {
        let projection = Arc::new(ConfigurationProjection::new());
        let adapter = Arc::new(MockAdapter::new());
        let ctx = OpContext::new();
        let device = DeviceName::parse("eth0").unwrap();

        adapter
            .add_qdisc(
                &ctx,
                &Qdisc {
                    common: QdiscCommon {
                        device: device.clone(),
                        handle: Handle::ROOT,
                        parent: None,
                    },
                    spec: QdiscSpec::Htb {
                        default_class: Handle::new(1, 999),
                        r2q: 10,
                    },
                },
            )
            .await
            .unwrap();
        adapter
            .add_class(
                &ctx,
                &HtbClass {
                    device: device.clone(),
                    parent: Handle::ROOT,
                    handle: Handle::new(1, 14),
                    name: "db".to_string(),
                    rate: Bandwidth::from_mbps(100),
                    ceil: Bandwidth::from_mbps(200),
                    burst: 125_000,
                    cburst: 250_000,
                    priority: None,
                },
            )
            .await
            .unwrap();

        projection.apply(&EventRecord {
            aggregate_id: "eth0".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            event: Event::HtbClassCreated {
                device,
                parent: Handle::ROOT,
                handle: Handle::new(1, 14),
                name: "db".to_string(),
                rate: Bandwidth::from_mbps(100),
                ceil: Bandwidth::from_mbps(200),
                burst: 125_000,
                cburst: 250_000,
            },
        });

        (QueryBus::new(projection, adapter.clone()), adapter)
    }

    #[tokio::test]
    async fn test_device_statistics_compose_names_with_counters() {
        let (queries, adapter) = fixture().await;
        adapter.set_class_counters(
            "eth0",
            Handle::new(1, 14),
            TrafficCounters {
                bytes: 1024,
                packets: 8,
                ..Default::default()
            },
        );

        let ctx = OpContext::new();
        let stats = queries.get_device_statistics(&ctx, "eth0").await.unwrap();
        assert_eq!(stats.qdisc_stats.len(), 1);
        assert_eq!(stats.qdisc_stats[0].kind, "htb");

        let class = &stats.class_stats[0];
        assert_eq!(class.handle, "1:14");
        assert_eq!(class.name.as_deref(), Some("db"));
        assert_eq!(class.stats.bytes, 1024);
    }

    #[tokio::test]
    async fn test_targeted_lookups() {
        let (queries, _adapter) = fixture().await;
        let ctx = OpContext::new();

        let qdisc = queries
            .get_qdisc_statistics(&ctx, "eth0", "1:0")
            .await
            .unwrap();
        assert_eq!(qdisc.kind, "htb");

        let class = queries
            .get_class_statistics(&ctx, "eth0", "1:14")
            .await
            .unwrap();
        assert_eq!(class.name.as_deref(), Some("db"));

        assert!(queries.get_qdisc_statistics(&ctx, "eth0", "9:0").await.is_err());
        assert!(queries.get_class_statistics(&ctx, "eth0", "1:77").await.is_err());
    }

    #[tokio::test]
    async fn test_configuration_reads_projection_only() {
        let (queries, _adapter) = fixture().await;
        let view = queries.get_configuration("eth0").unwrap();
        assert_eq!(view.classes.len(), 1);
        // The qdisc was installed on the adapter but never projected.
        assert!(view.qdiscs.is_empty());
    }
}
