//! In-memory event store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{EventStore, StoreError, StoreResult};
use crate::domain::{Event, EventRecord};

/// Event store backed by a mutex-guarded map of per-aggregate logs.
///
/// The mutex is held only for the duration of a check-and-append, which
/// gives the same atomicity the unique `(aggregate_id, event_version)`
/// index gives a durable backend.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    logs: Mutex<HashMap<String, Vec<EventRecord>>>,
}

impl InMemoryEventStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events held for an aggregate.
    pub fn event_count(&self, aggregate_id: &str) -> usize {
        self.logs
            .lock()
            .get(aggregate_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save(
        &self,
        aggregate_id: &str,
        events: Vec<Event>,
        expected_version: u64,
    ) -> StoreResult<Vec<EventRecord>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut logs = self.logs.lock();
        let log = logs.entry(aggregate_id.to_string()).or_default();

        let actual = log.last().map(|r| r.event_version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let occurred_at = Utc::now();
        let mut stored = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let record = EventRecord {
                aggregate_id: aggregate_id.to_string(),
                event_version: expected_version + 1 + offset as u64,
                occurred_at,
                event,
            };
            log.push(record.clone());
            stored.push(record);
        }
        Ok(stored)
    }

    async fn load(&self, aggregate_id: &str) -> StoreResult<Vec<EventRecord>> {
        Ok(self
            .logs
            .lock()
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_from(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> StoreResult<Vec<EventRecord>> {
        Ok(self
            .logs
            .lock()
            .get(aggregate_id)
            .map(|log| {
                log.iter()
                    .filter(|r| r.event_version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_all(&self) -> StoreResult<Vec<EventRecord>> {
        let mut all: Vec<EventRecord> = self
            .logs
            .lock()
            .values()
            .flat_map(|log| log.iter().cloned())
            .collect();
        all.sort_by_key(|r| (r.occurred_at, r.event_version));
        Ok(all)
    }
}
