//! In-process event bus.
//!
//! Fans committed events out to subscribers in publish order. Delivery is
//! at-most-once within the publishing call; nothing is persisted or
//! buffered across restarts. A failing subscriber is recorded and the
//! remaining subscribers still run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::domain::EventRecord;
use crate::error::Error;

/// A consumer of committed events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in failure reports and logs.
    fn name(&self) -> &'static str;

    /// Handle one committed event.
    async fn on_event(&self, record: &EventRecord) -> Result<(), Error>;
}

/// One subscriber's failure during a publish.
#[derive(Debug, Clone)]
pub struct SubscriberFailure {
    /// The failing subscriber's name.
    pub subscriber: &'static str,
    /// The event type it failed on.
    pub event_type: &'static str,
    /// The event's version within its aggregate.
    pub event_version: u64,
    /// What went wrong.
    pub error: Error,
}

#[derive(Default)]
struct Subscriptions {
    by_type: HashMap<String, Vec<Arc<dyn EventSubscriber>>>,
    all: Vec<Arc<dyn EventSubscriber>>,
}

/// Subscribe/publish hub for domain events.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Subscriptions>,
}

impl EventBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one event type tag.
    pub fn subscribe(&self, event_type: &str, subscriber: Arc<dyn EventSubscriber>) {
        self.subscriptions
            .write()
            .by_type
            .entry(event_type.to_string())
            .or_default()
            .push(subscriber);
    }

    /// Register a subscriber for every event type.
    pub fn subscribe_all(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscriptions.write().all.push(subscriber);
    }

    /// Deliver records, in order, to each interested subscriber.
    ///
    /// Returns the collected failures; an empty vector means every
    /// subscriber handled every event.
    pub async fn publish(&self, records: &[EventRecord]) -> Vec<SubscriberFailure> {
        let mut failures = Vec::new();

        for record in records {
            // Snapshot the recipients so no lock is held across awaits.
            // Type-scoped subscribers run before catch-all ones; within
            // each group, registration order.
            let recipients: Vec<Arc<dyn EventSubscriber>> = {
                let subs = self.subscriptions.read();
                subs.by_type
                    .get(record.type_tag())
                    .into_iter()
                    .flatten()
                    .chain(subs.all.iter())
                    .cloned()
                    .collect()
            };

            for subscriber in recipients {
                if let Err(error) = subscriber.on_event(record).await {
                    warn!(
                        subscriber = subscriber.name(),
                        event_type = record.type_tag(),
                        event_version = record.event_version,
                        %error,
                        "event subscriber failed"
                    );
                    failures.push(SubscriberFailure {
                        subscriber: subscriber.name(),
                        event_type: record.type_tag(),
                        event_version: record.event_version,
                        error,
                    });
                }
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;

    use crate::domain::{DeviceName, Event, Handle};

    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<u64>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_event(&self, record: &EventRecord) -> Result<(), Error> {
            self.seen.lock().push(record.event_version);
            if self.fail {
                return Err(Error::Storage("boom".to_string()));
            }
            Ok(())
        }
    }

    fn record(version: u64) -> EventRecord {
        EventRecord {
            aggregate_id: "eth0".to_string(),
            event_version: version,
            occurred_at: Utc::now(),
            event: Event::HtbQdiscCreated {
                device: DeviceName::parse("eth0").unwrap(),
                handle: Handle::ROOT,
                default_class: Handle::new(1, 999),
                r2q: 10,
            },
        }
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let bus = EventBus::new();
        let recorder = Recorder::new("recorder", false);
        bus.subscribe_all(recorder.clone());

        let failures = bus.publish(&[record(1), record(2), record(3)]).await;
        assert!(failures.is_empty());
        assert_eq!(*recorder.seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_type_scoped_subscription() {
        let bus = EventBus::new();
        let qdisc_sub = Recorder::new("qdisc", false);
        let class_sub = Recorder::new("class", false);
        bus.subscribe("HTBQdiscCreated", qdisc_sub.clone());
        bus.subscribe("HTBClassCreated", class_sub.clone());

        bus.publish(&[record(1)]).await;
        assert_eq!(qdisc_sub.seen.lock().len(), 1);
        assert!(class_sub.seen.lock().is_empty());
    }

    struct OrderProbe {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventSubscriber for OrderProbe {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_event(&self, _record: &EventRecord) -> Result<(), Error> {
            self.log.lock().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_type_scoped_runs_before_catch_all() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(Arc::new(OrderProbe {
            name: "catch-all",
            log: log.clone(),
        }));
        bus.subscribe(
            "HTBQdiscCreated",
            Arc::new(OrderProbe {
                name: "scoped",
                log: log.clone(),
            }),
        );

        bus.publish(&[record(1)]).await;
        assert_eq!(*log.lock(), vec!["scoped", "catch-all"]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let bad = Recorder::new("bad", true);
        let good = Recorder::new("good", false);
        bus.subscribe_all(bad.clone());
        bus.subscribe_all(good.clone());

        let failures = bus.publish(&[record(1), record(2)]).await;
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.subscriber == "bad"));
        assert_eq!(*good.seen.lock(), vec![1, 2]);
    }
}
