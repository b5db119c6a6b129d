//! End-to-end policy scenarios over the in-memory service and mock
//! adapter: no root, no network, no kernel.

use tcplane::{
    Command, Controller, DeviceName, DomainError, Error, Event, OpContext,
    TrafficControlService,
};
use tracing_subscriber::EnvFilter;

/// Honor RUST_LOG when debugging a failing scenario.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn qdisc_cmd(device: &str) -> Command {
    Command::CreateHtbQdisc {
        device: device.to_string(),
        handle: "1:0".to_string(),
        default_class: "1:999".to_string(),
        r2q: None,
    }
}

fn class_cmd(device: &str, minor: u16, name: &str) -> Command {
    Command::CreateHtbClass {
        device: device.to_string(),
        parent: "1:0".to_string(),
        handle: format!("1:{minor}"),
        name: name.to_string(),
        rate: "10Mbps".to_string(),
        ceil: None,
    }
}

/// Single-class apply: the exact event sequence of the canonical policy.
#[tokio::test]
async fn single_class_apply_emits_expected_events() {
    init_tracing();
    let mut controller = Controller::new("eth0");
    controller.with_hard_limit_bandwidth("1Gbps");
    controller
        .create_traffic_class("db")
        .with_guaranteed_bandwidth("100Mbps")
        .with_soft_limit_bandwidth("200Mbps")
        .with_priority(4)
        .for_destination("192.168.1.10")
        .apply()
        .await
        .unwrap();

    let records = controller.service().store().load("eth0").await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(
        records.iter().map(|r| r.event_version).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );

    match &records[0].event {
        Event::HtbQdiscCreated {
            handle,
            default_class,
            ..
        } => {
            assert_eq!(handle.to_string(), "1:0");
            assert_eq!(default_class.to_string(), "1:999");
        }
        other => panic!("expected HTBQdiscCreated, got {other:?}"),
    }

    match &records[1].event {
        Event::HtbClassCreated {
            handle, rate, ceil, ..
        } => {
            assert_eq!(handle.to_string(), "1:14");
            assert_eq!(rate.bits_per_second(), 100_000_000);
            assert_eq!(ceil.bits_per_second(), 200_000_000);
        }
        other => panic!("expected HTBClassCreated, got {other:?}"),
    }

    match &records[2].event {
        Event::FilterCreated {
            parent,
            priority,
            flow_id,
            matches,
            ..
        } => {
            assert_eq!(parent.to_string(), "1:0");
            assert_eq!(priority.value(), 100);
            assert_eq!(flow_id.to_string(), "1:14");
            assert_eq!(matches.len(), 1);
            assert_eq!(matches[0].type_tag(), "ip_dst");
            assert_eq!(matches[0].render(), "192.168.1.10");
        }
        other => panic!("expected FilterCreated, got {other:?}"),
    }

    match &records[3].event {
        Event::HtbClassCreated {
            handle, rate, ceil, ..
        } => {
            assert_eq!(handle.to_string(), "1:999");
            assert_eq!(rate.bits_per_second(), 1_000_000);
            assert_eq!(ceil.bits_per_second(), 1_000_000_000);
        }
        other => panic!("expected default HTBClassCreated, got {other:?}"),
    }
}

/// Validation failure: a class rate above the declared total.
#[tokio::test]
async fn rate_above_total_rejects_before_any_event() {
    let mut controller = Controller::new("eth0");
    controller.with_hard_limit_bandwidth("50Mbps");
    let err = controller
        .create_traffic_class("video")
        .with_guaranteed_bandwidth("100Mbps")
        .with_priority(3)
        .apply()
        .await
        .unwrap_err();

    match err {
        Error::Domain(DomainError::ValueRejected { field, reason }) => {
            assert_eq!(field, "rate");
            assert_eq!(reason, "exceeds total");
        }
        other => panic!("expected ValueRejected, got {other:?}"),
    }
    assert!(controller.service().store().load("eth0").await.unwrap().is_empty());
}

/// Validation failure: a class without a priority.
#[tokio::test]
async fn missing_priority_rejects_before_any_event() {
    let mut controller = Controller::new("eth0");
    controller.with_hard_limit_bandwidth("1Gbps");
    let err = controller
        .create_traffic_class("x")
        .with_guaranteed_bandwidth("10Mbps")
        .apply()
        .await
        .unwrap_err();

    match err {
        Error::Domain(DomainError::ValueRejected { field, reason }) => {
            assert_eq!(field, "priority");
            assert_eq!(reason, "missing");
        }
        other => panic!("expected ValueRejected, got {other:?}"),
    }
    assert!(controller.service().store().load("eth0").await.unwrap().is_empty());
}

/// Concurrency: of two writers starting from the same version, one
/// commits and one conflicts; the loser's retry converges.
#[tokio::test]
async fn concurrent_applies_conflict_then_converge_on_retry() {
    let service = TrafficControlService::in_memory();
    let ctx = OpContext::new();
    let device = DeviceName::parse("eth0").unwrap();

    // Both writers load at version 0.
    let mut first = service.commands().load_aggregate(&device).await.unwrap();
    let mut second = service.commands().load_aggregate(&device).await.unwrap();

    let outcome = service
        .commands()
        .commit(
            &ctx,
            &mut first,
            &[qdisc_cmd("eth0"), class_cmd("eth0", 11, "alpha")],
        )
        .await
        .unwrap();
    assert_eq!(outcome.version, 2);

    let err = service
        .commands()
        .commit(
            &ctx,
            &mut second,
            &[qdisc_cmd("eth0"), class_cmd("eth0", 12, "beta")],
        )
        .await
        .unwrap_err();
    assert!(err.is_concurrency_conflict());

    // Retry from a fresh load: the qdisc already exists, so only the
    // loser's class commits on top of the winner's version.
    let mut retry = service.commands().load_aggregate(&device).await.unwrap();
    let outcome = service
        .commands()
        .commit(&ctx, &mut retry, &[class_cmd("eth0", 12, "beta")])
        .await
        .unwrap();
    assert_eq!(outcome.version, 3);

    let view = service.queries().get_configuration("eth0").unwrap();
    assert!(view.class("1:11").is_some());
    assert!(view.class("1:12").is_some());
}

/// The same race through the fluent API: the retry path is a plain
/// re-apply, which plans only the missing pieces.
#[tokio::test]
async fn controller_reapply_after_peer_commit_adds_only_its_classes() {
    let service = TrafficControlService::in_memory();

    let mut alice = Controller::with_service(service.clone(), "eth0");
    alice.with_hard_limit_bandwidth("1Gbps");
    alice
        .create_traffic_class("alpha")
        .with_guaranteed_bandwidth("100Mbps")
        .with_priority(1)
        .apply()
        .await
        .unwrap();

    let mut bob = Controller::with_service(service.clone(), "eth0");
    bob.with_hard_limit_bandwidth("1Gbps");
    bob.create_traffic_class("beta")
        .with_guaranteed_bandwidth("200Mbps")
        .with_priority(2)
        .apply()
        .await
        .unwrap();

    let view = service.queries().get_configuration("eth0").unwrap();
    assert!(view.class("1:11").is_some(), "alice's class present");
    assert!(view.class("1:12").is_some(), "bob's class present");
    // One qdisc and one default class, not two.
    assert_eq!(view.qdiscs.len(), 1);
    assert_eq!(
        view.classes.iter().filter(|c| c.handle == "1:999").count(),
        1
    );
}

/// A mark match installs via the fw classifier, not u32.
#[tokio::test]
async fn mark_match_installs_fw_classifier() {
    let mut controller = Controller::new("eth0");
    controller.with_hard_limit_bandwidth("1Gbps");
    controller
        .create_traffic_class("marked")
        .with_guaranteed_bandwidth("10Mbps")
        .with_priority(5)
        .for_mark(0x100)
        .apply()
        .await
        .unwrap();

    let ctx = OpContext::new();
    let device = DeviceName::parse("eth0").unwrap();
    let filters = controller
        .service()
        .adapter()
        .get_filters(&ctx, &device)
        .await
        .unwrap();

    let fw: Vec<_> = filters.iter().filter(|f| f.kind == "fw").collect();
    assert_eq!(fw.len(), 1);
    assert_eq!(fw[0].flow_id.map(|h| h.to_string()), Some("1:15".to_string()));

    // The catch-all default-class routing stays u32.
    assert!(filters.iter().all(|f| f.kind == "fw" || f.kind == "u32"));
}

/// Statistics composition after the single-class apply.
#[tokio::test]
async fn statistics_compose_projection_and_adapter() {
    let mut controller = Controller::new("eth0");
    controller.with_hard_limit_bandwidth("1Gbps");
    controller
        .create_traffic_class("db")
        .with_guaranteed_bandwidth("100Mbps")
        .with_soft_limit_bandwidth("200Mbps")
        .with_priority(4)
        .for_destination("192.168.1.10")
        .apply()
        .await
        .unwrap();

    let stats = controller.get_statistics().await.unwrap();
    assert_eq!(stats.device, "eth0");
    assert_eq!(stats.qdisc_stats.len(), 1);
    assert_eq!(stats.qdisc_stats[0].handle, "1:0");
    assert_eq!(stats.qdisc_stats[0].kind, "htb");

    let handles: Vec<_> = stats.class_stats.iter().map(|c| c.handle.as_str()).collect();
    assert!(handles.contains(&"1:14"));
    assert!(handles.contains(&"1:999"));

    let db = stats.class_stats.iter().find(|c| c.handle == "1:14").unwrap();
    assert_eq!(db.name.as_deref(), Some("db"));

    let qdisc = controller.get_qdisc_statistics("1:0").await.unwrap();
    assert_eq!(qdisc.kind, "htb");
    let class = controller.get_class_statistics("1:999").await.unwrap();
    assert_eq!(class.name.as_deref(), Some("default"));
}

/// Filter priority intervals: class i's filters occupy
/// [100 + 10i, 100 + 10i + n_i) and never overlap.
#[tokio::test]
async fn filter_priorities_partition_by_declaration_index() {
    let mut controller = Controller::new("eth0");
    controller.with_hard_limit_bandwidth("1Gbps");
    controller
        .create_traffic_class("first")
        .with_guaranteed_bandwidth("10Mbps")
        .with_priority(0)
        .for_destination("10.0.0.0/8")
        .for_port(5432)
        .for_port(5433)
        .done()
        .create_traffic_class("second")
        .with_guaranteed_bandwidth("10Mbps")
        .with_priority(1)
        .for_source("192.168.0.0/16")
        .done()
        .create_traffic_class("third")
        .with_guaranteed_bandwidth("10Mbps")
        .with_priority(2)
        .apply()
        .await
        .unwrap();

    let view = controller
        .service()
        .queries()
        .get_configuration("eth0")
        .unwrap();

    let priorities_for = |flow: &str| -> Vec<u16> {
        view.filters
            .iter()
            .filter(|f| f.flow_id == flow)
            .map(|f| f.priority)
            .collect()
    };

    assert_eq!(priorities_for("1:10"), vec![100, 101, 102]);
    assert_eq!(priorities_for("1:11"), vec![110]);
    // A class with no matches gets one catch-all at its base priority.
    assert_eq!(priorities_for("1:12"), vec![120]);

    let all: Vec<u16> = view.filters.iter().map(|f| f.priority).collect();
    let mut deduped = all.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(all.len(), deduped.len(), "no overlapping priorities");
}

/// Unclassified-traffic catch-all: a class without matches still gets a
/// filter routing to it.
#[tokio::test]
async fn class_without_matches_gets_catch_all_filter() {
    let mut controller = Controller::new("eth0");
    controller.with_hard_limit_bandwidth("1Gbps");
    controller
        .create_traffic_class("bulk")
        .with_guaranteed_bandwidth("10Mbps")
        .with_priority(7)
        .apply()
        .await
        .unwrap();

    let view = controller
        .service()
        .queries()
        .get_configuration("eth0")
        .unwrap();
    let filter = view
        .filters
        .iter()
        .find(|f| f.flow_id == "1:17")
        .expect("catch-all filter exists");
    assert_eq!(filter.priority, 100);
    assert!(filter.matches.is_empty());
}
