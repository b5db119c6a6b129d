//! Domain events and the persisted event envelope.
//!
//! Every state transition is recorded as one immutable [`Event`]. The enum
//! is a closed sum type with a self-describing `event_type` tag so durable
//! stores can decode polymorphically; bandwidths persist as integer bits
//! per second and handles in their `"M:m"` display form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bandwidth::Bandwidth;
use super::device::DeviceName;
use super::filter::Match;
use super::handle::Handle;
use super::priority::FilterPriority;
use super::protocol::LinkProtocol;

/// A committed state transition on one device's TC tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    /// An HTB root qdisc was created.
    #[serde(rename = "HTBQdiscCreated")]
    HtbQdiscCreated {
        /// Owning device.
        device: DeviceName,
        /// Qdisc handle.
        handle: Handle,
        /// Class receiving unclassified traffic (may be forward-declared).
        default_class: Handle,
        /// Rate-to-quantum ratio.
        r2q: u32,
    },

    /// A TBF root qdisc was created.
    #[serde(rename = "TBFQdiscCreated")]
    TbfQdiscCreated {
        /// Owning device.
        device: DeviceName,
        /// Qdisc handle.
        handle: Handle,
        /// Shaping rate in bits per second.
        rate: Bandwidth,
        /// Token buffer in bytes.
        buffer: u32,
        /// Queue limit in bytes.
        limit: u32,
        /// Burst in bytes; 0 derives at install time.
        burst: u32,
    },

    /// A PRIO root qdisc was created.
    #[serde(rename = "PRIOQdiscCreated")]
    PrioQdiscCreated {
        /// Owning device.
        device: DeviceName,
        /// Qdisc handle.
        handle: Handle,
        /// Number of priority bands.
        bands: u8,
        /// Packet-priority to band map.
        priomap: [u8; 16],
    },

    /// An FQ_CODEL root qdisc was created.
    #[serde(rename = "FQCODELQdiscCreated")]
    FqCodelQdiscCreated {
        /// Owning device.
        device: DeviceName,
        /// Qdisc handle.
        handle: Handle,
        /// Queue limit in packets.
        limit: u32,
        /// Number of flow queues.
        flows: u32,
        /// CoDel target delay in microseconds.
        target: u32,
        /// CoDel interval in microseconds.
        interval: u32,
        /// Bytes per flow per round.
        quantum: u32,
        /// ECN marking enabled.
        ecn: bool,
    },

    /// An HTB class was created.
    #[serde(rename = "HTBClassCreated")]
    HtbClassCreated {
        /// Owning device.
        device: DeviceName,
        /// Parent qdisc or class.
        parent: Handle,
        /// The class's handle.
        handle: Handle,
        /// Policy name for the class.
        name: String,
        /// Guaranteed bandwidth in bits per second.
        rate: Bandwidth,
        /// Borrowing ceiling in bits per second.
        ceil: Bandwidth,
        /// Token buffer for rate, bytes.
        burst: u32,
        /// Token buffer for ceil, bytes.
        cburst: u32,
    },

    /// A classifier filter was created.
    #[serde(rename = "FilterCreated")]
    FilterCreated {
        /// Owning device.
        device: DeviceName,
        /// Qdisc the filter attaches to.
        parent: Handle,
        /// Match precedence.
        priority: FilterPriority,
        /// The filter's handle.
        handle: Handle,
        /// Target class.
        flow_id: Handle,
        /// Link-layer protocol.
        link_protocol: LinkProtocol,
        /// Match conditions, persisted as `(type, rendered value)` pairs.
        matches: Vec<Match>,
    },
}

impl Event {
    /// The stable `event_type` tag for this event.
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::HtbQdiscCreated { .. } => "HTBQdiscCreated",
            Self::TbfQdiscCreated { .. } => "TBFQdiscCreated",
            Self::PrioQdiscCreated { .. } => "PRIOQdiscCreated",
            Self::FqCodelQdiscCreated { .. } => "FQCODELQdiscCreated",
            Self::HtbClassCreated { .. } => "HTBClassCreated",
            Self::FilterCreated { .. } => "FilterCreated",
        }
    }

    /// Every known `event_type` tag.
    pub const ALL_TYPE_TAGS: [&'static str; 6] = [
        "HTBQdiscCreated",
        "TBFQdiscCreated",
        "PRIOQdiscCreated",
        "FQCODELQdiscCreated",
        "HTBClassCreated",
        "FilterCreated",
    ];

    /// The device this event belongs to; also the aggregate identity.
    pub fn device(&self) -> &DeviceName {
        match self {
            Self::HtbQdiscCreated { device, .. }
            | Self::TbfQdiscCreated { device, .. }
            | Self::PrioQdiscCreated { device, .. }
            | Self::FqCodelQdiscCreated { device, .. }
            | Self::HtbClassCreated { device, .. }
            | Self::FilterCreated { device, .. } => device,
        }
    }
}

/// A stored event: the payload plus its position in the log.
///
/// This is the unit durable backends persist: `(aggregate_id, event_type,
/// payload, event_version, occurred_at)` with a unique index on
/// `(aggregate_id, event_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The aggregate the event belongs to (the device name).
    pub aggregate_id: String,
    /// Per-aggregate sequence number, 1-based.
    pub event_version: u64,
    /// Wall-clock commit time, UTC.
    pub occurred_at: DateTime<Utc>,
    /// The event payload, tagged with its `event_type`.
    #[serde(flatten)]
    pub event: Event,
}

impl EventRecord {
    /// The stable `event_type` tag of the payload.
    pub const fn type_tag(&self) -> &'static str {
        self.event.type_tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filter::Cidr;
    use crate::domain::protocol::TransportProtocol;

    fn device() -> DeviceName {
        DeviceName::parse("eth0").unwrap()
    }

    fn sample_events() -> Vec<Event> {
        vec![
            Event::HtbQdiscCreated {
                device: device(),
                handle: Handle::ROOT,
                default_class: Handle::new(1, 999),
                r2q: 10,
            },
            Event::TbfQdiscCreated {
                device: device(),
                handle: Handle::ROOT,
                rate: Bandwidth::from_mbps(50),
                buffer: 1600,
                limit: 3000,
                burst: 0,
            },
            Event::PrioQdiscCreated {
                device: device(),
                handle: Handle::ROOT,
                bands: 3,
                priomap: [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1],
            },
            Event::FqCodelQdiscCreated {
                device: device(),
                handle: Handle::ROOT,
                limit: 10240,
                flows: 1024,
                target: 5_000,
                interval: 100_000,
                quantum: 1514,
                ecn: true,
            },
            Event::HtbClassCreated {
                device: device(),
                parent: Handle::ROOT,
                handle: Handle::new(1, 14),
                name: "db".to_string(),
                rate: Bandwidth::from_mbps(100),
                ceil: Bandwidth::from_mbps(200),
                burst: 125_000,
                cburst: 250_000,
            },
            Event::FilterCreated {
                device: device(),
                parent: Handle::ROOT,
                priority: FilterPriority::new(100).unwrap(),
                handle: Handle::new(0, 100),
                flow_id: Handle::new(1, 14),
                link_protocol: LinkProtocol::Ip,
                matches: vec![
                    Match::IpDestination(Cidr::parse("192.168.1.10").unwrap()),
                    Match::Protocol(TransportProtocol::Tcp),
                ],
            },
        ]
    }

    #[test]
    fn test_type_tags_are_stable() {
        let tags: Vec<_> = sample_events().iter().map(|e| e.type_tag()).collect();
        assert_eq!(
            tags,
            vec![
                "HTBQdiscCreated",
                "TBFQdiscCreated",
                "PRIOQdiscCreated",
                "FQCODELQdiscCreated",
                "HTBClassCreated",
                "FilterCreated",
            ]
        );
    }

    #[test]
    fn test_json_round_trip_every_variant() {
        for event in sample_events() {
            let json = serde_json::to_string(&event).unwrap();
            let back: Event = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn test_json_carries_event_type_tag() {
        for event in sample_events() {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event_type"], event.type_tag());
        }
    }

    #[test]
    fn test_class_event_persists_rate_as_bits_per_second() {
        let event = &sample_events()[4];
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["rate"], 100_000_000);
        assert_eq!(json["ceil"], 200_000_000);
        assert_eq!(json["handle"], "1:14");
    }

    #[test]
    fn test_record_envelope_round_trip() {
        let record = EventRecord {
            aggregate_id: "eth0".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            event: sample_events().remove(0),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_envelope_flattens_event_type() {
        let record = EventRecord {
            aggregate_id: "eth0".to_string(),
            event_version: 3,
            occurred_at: Utc::now(),
            event: sample_events().remove(5),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event_type"], "FilterCreated");
        assert_eq!(json["aggregate_id"], "eth0");
        assert_eq!(json["event_version"], 3);
        assert_eq!(json["matches"][0]["match_type"], "ip_dst");
    }
}
