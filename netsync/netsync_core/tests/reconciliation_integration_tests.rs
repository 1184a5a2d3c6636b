//! Integration tests for device report reconciliation
//!
//! These tests drive the flow and group managers through a full controller
//! built on the in-memory clustered map and verify:
//! - Report processing is idempotent
//! - Entries missing from a device are re-applied exactly once
//! - Entries only the device knows about are removed
//! - Idle flows expire after their timeout
//! - Writes for devices mastered elsewhere reach only the master

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use device_adapter::MockDeviceAdapter;
use device_adapter_interface::AdapterRegistry;
use netsync_core::{
    LivenessBootstrap, ManualClock, StaticMastership, SyncConfig, SyncController, SyncDeps,
    SyncMaps,
};
use netsync_shared_types::{
    ApplicationId, DeviceId, FlowEntry, FlowEntryState, FlowRule, FlowRuleEvent, GroupBucket,
    GroupDescription, GroupEntry, GroupKey, GroupState, GroupType, NodeId, TrafficSelector,
    TrafficTreatment,
};
use observability::CollectingListener;
use state_store_interface::InMemoryStorage;

// ============================================================================
// Test cluster
// ============================================================================

struct TestNode {
    controller: SyncController,
    flows: Arc<MockDeviceAdapter<FlowRule>>,
    groups: Arc<MockDeviceAdapter<GroupDescription>>,
    clock: Arc<ManualClock>,
    flow_events: Arc<CollectingListener<FlowRuleEvent>>,
}

/// Builds a controller for `node`. Devices in `devices` get their own mock
/// adapters; `masters` pins devices to nodes.
fn test_node(
    storage: &Arc<InMemoryStorage>,
    node: &str,
    devices: &[&str],
    masters: &[(&str, &str)],
    config: SyncConfig,
) -> TestNode {
    let node_id = NodeId::new(node);
    let mastership = StaticMastership::new(node_id.clone());
    for (device, master) in masters {
        mastership.set_master(DeviceId::new(*device), NodeId::new(*master));
    }

    let flows = Arc::new(MockDeviceAdapter::new("mock"));
    let groups = Arc::new(MockDeviceAdapter::new("mock"));
    let flow_adapters = Arc::new(AdapterRegistry::new());
    let group_adapters = Arc::new(AdapterRegistry::new());
    for device in devices {
        flow_adapters.register(DeviceId::new(*device), flows.clone());
        group_adapters.register(DeviceId::new(*device), groups.clone());
    }

    let clock = Arc::new(ManualClock::new(1_000));
    let controller = SyncController::build(
        SyncConfig {
            local_node: node.to_string(),
            ..config
        },
        SyncDeps {
            maps: SyncMaps::open(&storage.for_node(node_id)).unwrap(),
            flow_adapters,
            group_adapters,
            mastership: Arc::new(mastership),
            clock: clock.clone(),
        },
    )
    .unwrap();

    let flow_events = Arc::new(CollectingListener::new());
    controller.flow_manager().add_listener(flow_events.clone());
    TestNode {
        controller,
        flows,
        groups,
        clock,
        flow_events,
    }
}

fn single_node() -> TestNode {
    let storage = Arc::new(InMemoryStorage::new());
    test_node(&storage, "node-1", &["of:1"], &[], SyncConfig::default())
}

fn device() -> DeviceId {
    DeviceId::new("of:1")
}

fn rule(app: &str, port: &str) -> FlowRule {
    FlowRule::new(
        device(),
        ApplicationId::new(app),
        10,
        TrafficSelector::new().matching("in_port", port),
        TrafficTreatment::new().instruction("output:1"),
    )
}

fn reported(rule: &FlowRule, packets: u64) -> FlowEntry {
    FlowEntry::reported(rule.clone(), packets, packets * 100, 1)
}

fn group(key: &str) -> GroupDescription {
    GroupDescription {
        device_id: device(),
        key: GroupKey::new(key),
        app_id: ApplicationId::new("fwd"),
        group_type: GroupType::All,
        buckets: vec![GroupBucket::new(TrafficTreatment::new().instruction("output:3"))],
    }
}

// ============================================================================
// Flow reconciliation
// ============================================================================

#[tokio::test]
async fn test_report_batch_is_idempotent() {
    let node = single_node();
    let flows = node.controller.flow_manager();
    let r = rule("fwd", "1");
    flows.apply_flow_rules(slice::from_ref(&r)).await.unwrap();

    flows.push_flow_metrics(&device(), vec![reported(&r, 5)]).await.unwrap();
    let once = flows.get_flow_entries(&device()).await.unwrap();

    flows.push_flow_metrics(&device(), vec![reported(&r, 5)]).await.unwrap();
    let twice = flows.get_flow_entries(&device()).await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.len(), 1);
    assert_eq!(twice[0].state, FlowEntryState::Added);
    assert_eq!(twice[0].packets, 5);
}

#[tokio::test]
async fn test_missing_flow_is_reapplied_exactly_once() {
    let node = single_node();
    let flows = node.controller.flow_manager();
    let r = rule("fwd", "1");
    flows.apply_flow_rules(slice::from_ref(&r)).await.unwrap();
    flows.push_flow_metrics(&device(), vec![reported(&r, 5)]).await.unwrap();
    let before = flows.get_flow_entries(&device()).await.unwrap();
    node.flows.clear_calls();

    flows.push_flow_metrics(&device(), vec![]).await.unwrap();

    assert_eq!(node.flows.applied(), vec![r]);
    assert!(node.flows.removed().is_empty());
    assert_eq!(flows.get_flow_entries(&device()).await.unwrap(), before);
}

#[tokio::test]
async fn test_extraneous_flow_is_removed_from_device_only() {
    let node = single_node();
    let flows = node.controller.flow_manager();
    let stray = rule("cli", "9");
    node.flows.install_out_of_band(stray.clone());

    flows.push_flow_metrics(&device(), vec![reported(&stray, 1)]).await.unwrap();

    assert_eq!(node.flows.removed(), vec![stray]);
    assert_eq!(flows.flow_rule_count().await.unwrap(), 0);
    assert!(node.flows.installed(&device()).is_empty());
}

#[tokio::test]
async fn test_idle_flow_expires_after_timeout() {
    let node = single_node();
    let flows = node.controller.flow_manager();
    let r = rule("fwd", "1").with_timeout(5);
    flows.apply_flow_rules(slice::from_ref(&r)).await.unwrap();
    flows.push_flow_metrics(&device(), vec![reported(&r, 0)]).await.unwrap();
    node.flows.clear_calls();

    node.clock.advance(Duration::from_secs(6));
    flows.push_flow_metrics(&device(), vec![reported(&r, 0)]).await.unwrap();

    assert_eq!(node.flows.removed(), vec![r.clone()]);
    let entries = flows.get_flow_entries(&device()).await.unwrap();
    assert_eq!(entries[0].state, FlowEntryState::PendingRemove);

    // Once the device stops reporting it, the removal is final and the
    // rule is not pushed back.
    flows.push_flow_metrics(&device(), vec![]).await.unwrap();
    assert_eq!(flows.flow_rule_count().await.unwrap(), 0);
    assert!(node.flows.applied().is_empty());
}

#[tokio::test]
async fn test_active_flow_outlives_timeout() {
    let node = single_node();
    let flows = node.controller.flow_manager();
    let r = rule("fwd", "1").with_timeout(5);
    flows.apply_flow_rules(slice::from_ref(&r)).await.unwrap();
    flows.push_flow_metrics(&device(), vec![reported(&r, 1)]).await.unwrap();

    for packets in 2..5 {
        node.clock.advance(Duration::from_secs(4));
        flows.push_flow_metrics(&device(), vec![reported(&r, packets)]).await.unwrap();
    }

    let entries = flows.get_flow_entries(&device()).await.unwrap();
    assert_eq!(entries[0].state, FlowEntryState::Added);
    assert_eq!(entries[0].packets, 4);
    assert!(node.flows.removed().is_empty());
}

#[tokio::test]
async fn test_permanent_flow_never_expires() {
    let node = single_node();
    let flows = node.controller.flow_manager();
    let r = rule("fwd", "1");
    flows.apply_flow_rules(slice::from_ref(&r)).await.unwrap();

    flows.push_flow_metrics(&device(), vec![reported(&r, 0)]).await.unwrap();
    node.clock.advance(Duration::from_secs(3_600));
    flows.push_flow_metrics(&device(), vec![reported(&r, 0)]).await.unwrap();

    assert!(node.flows.removed().is_empty());
    assert_eq!(flows.flow_rule_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_current_time_bootstrap_spares_stale_flow() {
    let storage = Arc::new(InMemoryStorage::new());
    let config = SyncConfig {
        liveness_bootstrap: LivenessBootstrap::CurrentTime,
        ..SyncConfig::default()
    };
    let node = test_node(&storage, "node-1", &["of:1"], &[], config);
    let flows = node.controller.flow_manager();
    let r = rule("fwd", "1").with_timeout(5);
    flows.apply_flow_rules(slice::from_ref(&r)).await.unwrap();

    // First report arrives long after the rule was stored.
    node.clock.advance(Duration::from_secs(60));
    flows.push_flow_metrics(&device(), vec![reported(&r, 0)]).await.unwrap();

    assert!(node.flows.removed().is_empty());
    let entries = flows.get_flow_entries(&device()).await.unwrap();
    assert_eq!(entries[0].state, FlowEntryState::Added);
}

#[tokio::test]
async fn test_remove_by_owner_then_report_finalises() {
    let node = single_node();
    let flows = node.controller.flow_manager();
    let mine = [rule("fwd", "1"), rule("fwd", "2")];
    let theirs = rule("acl", "3");
    flows.apply_flow_rules(&mine).await.unwrap();
    flows.apply_flow_rules(slice::from_ref(&theirs)).await.unwrap();

    flows.remove_flow_rules_by_id(&ApplicationId::new("fwd")).await.unwrap();
    let mut removed = node.flows.removed();
    removed.sort_by_key(|r| r.id);
    let mut expected = mine.to_vec();
    expected.sort_by_key(|r| r.id);
    assert_eq!(removed, expected);

    flows.push_flow_metrics(&device(), vec![reported(&theirs, 1)]).await.unwrap();
    node.controller.flush_events().await;

    let remaining = flows.get_flow_entries(&device()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].rule, theirs);
    let finalised = node
        .flow_events
        .events()
        .into_iter()
        .filter(|e| matches!(e, FlowRuleEvent::RuleRemoved(_)))
        .count();
    assert_eq!(finalised, 2);
}

#[tokio::test]
async fn test_remote_apply_reaches_master_only() {
    let storage = Arc::new(InMemoryStorage::new());
    let masters = [("of:1", "node-1"), ("of:2", "node-2")];
    let devices = ["of:1", "of:2"];
    let first = test_node(&storage, "node-1", &devices, &masters, SyncConfig::default());
    let second = test_node(&storage, "node-2", &devices, &masters, SyncConfig::default());

    let remote_rule = FlowRule::new(
        DeviceId::new("of:2"),
        ApplicationId::new("fwd"),
        10,
        TrafficSelector::new().matching("in_port", "1"),
        TrafficTreatment::new().instruction("output:1"),
    );
    first
        .controller
        .flow_manager()
        .apply_flow_rules(slice::from_ref(&remote_rule))
        .await
        .unwrap();
    second.controller.flush_events().await;

    assert!(first.flows.applied().is_empty());
    assert_eq!(second.flows.applied(), vec![remote_rule.clone()]);
    assert!(matches!(
        second.flow_events.events().as_slice(),
        [FlowRuleEvent::RuleAddRequested(_)]
    ));
    let seen_by_master = second
        .controller
        .flow_manager()
        .get_flow_entries(&remote_rule.device_id)
        .await
        .unwrap();
    assert_eq!(seen_by_master.len(), 1);
}

// ============================================================================
// Group reconciliation
// ============================================================================

#[tokio::test]
async fn test_group_self_heal_and_extraneous_removal() {
    let node = single_node();
    let groups = node.controller.group_manager();
    let wanted = group("ecmp");
    let stray = group("stray");
    groups.add_groups(slice::from_ref(&wanted)).await.unwrap();
    groups
        .push_group_metrics(&device(), vec![GroupEntry::reported(wanted.clone(), 1, 64)])
        .await
        .unwrap();
    node.groups.clear_calls();

    groups
        .push_group_metrics(&device(), vec![GroupEntry::reported(stray.clone(), 1, 64)])
        .await
        .unwrap();

    assert_eq!(node.groups.applied(), vec![wanted.clone()]);
    assert_eq!(node.groups.removed(), vec![stray]);
    let stored = groups.get_groups(&device()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].state, GroupState::Added);
}
