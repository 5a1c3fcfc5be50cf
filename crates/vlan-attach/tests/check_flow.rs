//! CHECK verifies without mutating.

use std::sync::Arc;

use attach_test::{cmd_args, conf_with_ipam, FakeNetns, MockIpam, MockLinkTable, StaticPolicyGate};
use vlan_attach::engine::AttachEngine;

fn engine_with(
    links: &Arc<MockLinkTable>,
    policy: StaticPolicyGate,
    ipam: &Arc<MockIpam>,
) -> AttachEngine {
    AttachEngine::new(links.clone(), Arc::new(policy), ipam.clone())
}

/// ADD first, so CHECK sees a correctly attached workload.
async fn attached() -> (Arc<MockLinkTable>, Arc<MockIpam>, FakeNetns) {
    let links = Arc::new(MockLinkTable::with_uplink("eth0", 9100));
    let ipam = Arc::new(MockIpam::new());
    let netns = FakeNetns::new();

    let engine = engine_with(&links, StaticPolicyGate::allow(), &ipam);
    let conf = conf_with_ipam("finance", "eth0", 100, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");
    engine.add(&args, &conf).await.unwrap();

    (links, ipam, netns)
}

#[tokio::test]
async fn check_passes_on_a_correct_attachment() {
    let (links, ipam, netns) = attached().await;
    let engine = engine_with(&links, StaticPolicyGate::allow(), &ipam);
    let conf = conf_with_ipam("finance", "eth0", 100, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");

    let reply = engine.check(&args, &conf).await.unwrap();

    assert_eq!(reply.interfaces[0].name, "eth0");
    assert_eq!(reply.ips[0].address, "10.100.0.5/24");
}

#[tokio::test]
async fn check_reauthorizes_with_add_semantics() {
    let (links, ipam, netns) = attached().await;
    let engine = engine_with(&links, StaticPolicyGate::deny("revoked"), &ipam);
    let conf = conf_with_ipam("finance", "eth0", 100, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");

    let err = engine.check(&args, &conf).await.unwrap_err();

    assert_eq!(err.kind(), "PolicyError");
}

#[tokio::test]
async fn check_reports_a_missing_interface() {
    let links = Arc::new(MockLinkTable::with_uplink("eth0", 9100));
    let ipam = Arc::new(MockIpam::new());
    let netns = FakeNetns::new();
    let engine = engine_with(&links, StaticPolicyGate::allow(), &ipam);
    let conf = conf_with_ipam("finance", "eth0", 100, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");

    let err = engine.check(&args, &conf).await.unwrap_err();

    assert_eq!(err.kind(), "NamespaceError");
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn check_reports_a_tag_mismatch_without_mutating() {
    let (links, ipam, netns) = attached().await;
    let engine = engine_with(&links, StaticPolicyGate::allow(), &ipam);
    // The configuration now asks for a different tag than the one attached.
    let conf = conf_with_ipam("finance", "eth0", 200, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");

    let ops_before = links.ops();
    let err = engine.check(&args, &conf).await.unwrap_err();

    assert_eq!(err.kind(), "InterfaceError");
    assert!(err.to_string().contains("expected 200"));
    assert_eq!(links.ops(), ops_before);
    assert!(links.ns_link(netns.path(), "eth0").is_some());
}

#[tokio::test]
async fn check_reports_a_missing_address_without_mutating() {
    let (links, ipam, netns) = attached().await;

    // Someone flushed the address out from under the workload.
    let mut link = links.ns_link(netns.path(), "eth0").unwrap();
    link.addresses.clear();
    links.add_ns_link(netns.path(), "eth0", link);

    let engine = engine_with(&links, StaticPolicyGate::allow(), &ipam);
    let conf = conf_with_ipam("finance", "eth0", 100, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");

    let ops_before = links.ops();
    let err = engine.check(&args, &conf).await.unwrap_err();

    assert_eq!(err.kind(), "IPAMError");
    assert_eq!(links.ops(), ops_before);
}

#[tokio::test]
async fn check_reports_an_address_outside_the_subnet() {
    let (links, ipam, netns) = attached().await;

    let mut link = links.ns_link(netns.path(), "eth0").unwrap();
    link.addresses = vec!["192.168.7.9/24".to_string()];
    links.add_ns_link(netns.path(), "eth0", link);

    let engine = engine_with(&links, StaticPolicyGate::allow(), &ipam);
    let conf = conf_with_ipam("finance", "eth0", 100, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");

    let err = engine.check(&args, &conf).await.unwrap_err();

    assert_eq!(err.kind(), "IPAMError");
    assert!(err.to_string().contains("10.100.0.0/24"));
}

#[tokio::test]
async fn check_reports_a_missing_lease() {
    let (links, _ipam, netns) = attached().await;

    // Fresh allocator that never saw this workload.
    let ipam = Arc::new(MockIpam::new());
    let engine = engine_with(&links, StaticPolicyGate::allow(), &ipam);
    let conf = conf_with_ipam("finance", "eth0", 100, "10.100.0.0/24");
    let args = cmd_args("workload-1", netns.path(), "eth0");

    let err = engine.check(&args, &conf).await.unwrap_err();

    assert_eq!(err.kind(), "IPAMError");
    assert!(err.to_string().contains("no lease"));
}
