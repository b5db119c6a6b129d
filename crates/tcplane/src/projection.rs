//! Read-model projection.
//!
//! Folds committed events into a per-device [`ConfigurationView`]. The
//! projection is derived state: deterministically rebuildable from the
//! event log, updated by a single writer (the event bus), read by any
//! number of query callers via cloned snapshots.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::EventSubscriber;
use crate::domain::{Event, EventRecord};
use crate::error::Error;

/// A qdisc in the read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QdiscView {
    /// Qdisc handle, formatted.
    pub handle: String,
    /// Kind string ("htb", "tbf", "prio", "fq_codel").
    pub kind: String,
    /// HTB default class, when applicable.
    pub default_class: Option<String>,
}

/// A class in the read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassView {
    /// Class handle, formatted.
    pub handle: String,
    /// Parent handle, formatted.
    pub parent: String,
    /// Policy name.
    pub name: String,
    /// Guaranteed bandwidth in bits per second.
    pub rate: u64,
    /// Ceiling bandwidth in bits per second.
    pub ceil: u64,
}

/// A filter in the read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterView {
    /// Parent qdisc handle, formatted.
    pub parent: String,
    /// Match precedence.
    pub priority: u16,
    /// Filter handle, formatted.
    pub handle: String,
    /// Target class handle, formatted.
    pub flow_id: String,
    /// Rendered match conditions, e.g. `"ip_dst=192.168.1.10"`.
    pub matches: Vec<String>,
}

/// The queryable configuration of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct ConfigurationView {
    /// Device name.
    pub device: String,
    /// Highest folded event version.
    pub version: u64,
    /// Installed qdiscs.
    pub qdiscs: Vec<QdiscView>,
    /// Installed classes.
    pub classes: Vec<ClassView>,
    /// Installed filters, in creation order.
    pub filters: Vec<FilterView>,
}

impl ConfigurationView {
    fn empty(device: &str) -> Self {
        Self {
            device: device.to_string(),
            ..Default::default()
        }
    }

    /// Look up a class view by its formatted handle.
    pub fn class(&self, handle: &str) -> Option<&ClassView> {
        self.classes.iter().find(|c| c.handle == handle)
    }

    fn fold(&mut self, record: &EventRecord) {
        match &record.event {
            Event::HtbQdiscCreated {
                handle,
                default_class,
                ..
            } => self.qdiscs.push(QdiscView {
                handle: handle.to_string(),
                kind: "htb".to_string(),
                default_class: Some(default_class.to_string()),
            }),
            Event::TbfQdiscCreated { handle, .. } => self.qdiscs.push(QdiscView {
                handle: handle.to_string(),
                kind: "tbf".to_string(),
                default_class: None,
            }),
            Event::PrioQdiscCreated { handle, .. } => self.qdiscs.push(QdiscView {
                handle: handle.to_string(),
                kind: "prio".to_string(),
                default_class: None,
            }),
            Event::FqCodelQdiscCreated { handle, .. } => self.qdiscs.push(QdiscView {
                handle: handle.to_string(),
                kind: "fq_codel".to_string(),
                default_class: None,
            }),
            Event::HtbClassCreated {
                parent,
                handle,
                name,
                rate,
                ceil,
                ..
            } => self.classes.push(ClassView {
                handle: handle.to_string(),
                parent: parent.to_string(),
                name: name.clone(),
                rate: rate.bits_per_second(),
                ceil: ceil.bits_per_second(),
            }),
            Event::FilterCreated {
                parent,
                priority,
                handle,
                flow_id,
                matches,
                ..
            } => self.filters.push(FilterView {
                parent: parent.to_string(),
                priority: priority.value(),
                handle: handle.to_string(),
                flow_id: flow_id.to_string(),
                matches: matches
                    .iter()
                    .map(|m| format!("{}={}", m.type_tag(), m.render()))
                    .collect(),
            }),
        }
        self.version = record.event_version;
    }
}

/// Holds the per-device read models and folds events into them.
#[derive(Default)]
pub struct ConfigurationProjection {
    views: RwLock<HashMap<String, ConfigurationView>>,
}

impl ConfigurationProjection {
    /// An empty projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one committed record into its device's view.
    pub fn apply(&self, record: &EventRecord) {
        let mut views = self.views.write();
        views
            .entry(record.aggregate_id.clone())
            .or_insert_with(|| ConfigurationView::empty(&record.aggregate_id))
            .fold(record);
    }

    /// Snapshot a device's view. A device with no history gets an empty
    /// view at version 0.
    pub fn view(&self, device: &str) -> ConfigurationView {
        self.views
            .read()
            .get(device)
            .cloned()
            .unwrap_or_else(|| ConfigurationView::empty(device))
    }

    /// Drop all state and refold from a full, globally-ordered log.
    pub fn rebuild<'a>(&self, records: impl IntoIterator<Item = &'a EventRecord>) {
        let mut fresh: HashMap<String, ConfigurationView> = HashMap::new();
        for record in records {
            fresh
                .entry(record.aggregate_id.clone())
                .or_insert_with(|| ConfigurationView::empty(&record.aggregate_id))
                .fold(record);
        }
        *self.views.write() = fresh;
    }
}

#[async_trait]
impl EventSubscriber for ConfigurationProjection {
    fn name(&self) -> &'static str {
        "configuration-projection"
    }

    async fn on_event(&self, record: &EventRecord) -> Result<(), Error> {
        self.apply(record);
        Ok(())
    }
}
