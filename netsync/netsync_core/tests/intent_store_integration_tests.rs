//! Integration tests for the intent state store across cluster members
//!
//! Covers:
//! - Parking-state transition legality under both verification policies
//! - Local transient state giving way to remote parking writes
//! - Create followed by remove leaving nothing behind, and strict policy
//!   refusing to withdraw an intent that never parked
//! - Remote transitions surfacing as events on other members

use std::sync::Arc;

use device_adapter::MockDeviceAdapter;
use device_adapter_interface::AdapterRegistry;
use netsync_core::{
    IntentMaps, IntentStore, ManualClock, StaticMastership, SyncConfig, SyncController, SyncDeps,
    SyncMaps, VerificationPolicy, INSTALLABLE_INTENTS_MAP, INTENTS_MAP, INTENT_STATES_MAP,
};
use netsync_shared_types::{
    ApplicationId, ConnectPoint, DeviceId, Intent, IntentEvent, IntentId, IntentKind,
    IntentState, NodeId, SyncError, TrafficSelector,
};
use observability::CollectingListener;
use state_store_interface::{ConsistentMap, InMemoryStorage, NodeStorage};

struct Member {
    store: IntentStore,
    intents: Arc<dyn ConsistentMap<IntentId, Intent>>,
    states: Arc<dyn ConsistentMap<IntentId, IntentState>>,
    installables: Arc<dyn ConsistentMap<IntentId, Vec<Intent>>>,
}

fn member(node: &NodeStorage, policy: VerificationPolicy) -> Member {
    let intents = node.consistent_map(INTENTS_MAP).unwrap();
    let states = node.consistent_map(INTENT_STATES_MAP).unwrap();
    let installables = node.consistent_map(INSTALLABLE_INTENTS_MAP).unwrap();
    let store = IntentStore::new(
        IntentMaps {
            intents: Arc::clone(&intents),
            states: Arc::clone(&states),
            installables: Arc::clone(&installables),
        },
        policy,
    );
    Member {
        store,
        intents,
        states,
        installables,
    }
}

fn cluster(policy: VerificationPolicy) -> (Member, Member) {
    let storage = Arc::new(InMemoryStorage::new());
    (
        member(&storage.for_node(NodeId::new("node-1")), policy),
        member(&storage.for_node(NodeId::new("node-2")), policy),
    )
}

fn intent() -> Intent {
    Intent::new(
        ApplicationId::new("fwd"),
        100,
        IntentKind::PointToPoint {
            ingress: ConnectPoint::new(DeviceId::new("of:1"), 1),
            egress: ConnectPoint::new(DeviceId::new("of:1"), 2),
            selector: TrafficSelector::new(),
        },
    )
}

async fn withdrawn(store: &IntentStore, intent: &Intent) {
    store.create_intent(intent).await.unwrap();
    store.set_state(intent, IntentState::Installed).await.unwrap();
    store.set_state(intent, IntentState::Withdrawn).await.unwrap();
}

#[tokio::test]
async fn test_strict_rejects_installed_after_withdrawn() {
    let (local, _) = cluster(VerificationPolicy::Strict);
    let i = intent();
    withdrawn(&local.store, &i).await;

    let err = local.store.set_state(&i, IntentState::Installed).await.unwrap_err();

    assert!(matches!(
        err,
        SyncError::IllegalTransition {
            from: Some(IntentState::Withdrawn),
            to: IntentState::Installed,
            ..
        }
    ));
    assert_eq!(
        local.store.get_intent_state(&i.id).await.unwrap(),
        Some(IntentState::Withdrawn)
    );
}

#[tokio::test]
async fn test_lenient_applies_installed_after_withdrawn() {
    let (local, _) = cluster(VerificationPolicy::Lenient);
    let i = intent();
    withdrawn(&local.store, &i).await;

    let event = local.store.set_state(&i, IntentState::Installed).await.unwrap();

    assert_eq!(event, Some(IntentEvent::Installed(i.clone())));
    assert_eq!(
        local.store.get_parking_state(&i.id).await.unwrap(),
        Some(IntentState::Installed)
    );
}

#[tokio::test]
async fn test_remote_parking_write_replaces_local_transient() {
    let (local, remote) = cluster(VerificationPolicy::Strict);
    let i = intent();
    local.store.create_intent(&i).await.unwrap();
    local.store.set_state(&i, IntentState::Compiling).await.unwrap();
    assert_eq!(
        local.store.get_intent_state(&i.id).await.unwrap(),
        Some(IntentState::Compiling)
    );
    // Remote members only ever see parking states.
    assert_eq!(
        remote.store.get_intent_state(&i.id).await.unwrap(),
        Some(IntentState::Submitted)
    );

    remote.store.set_state(&i, IntentState::Failed).await.unwrap();

    assert_eq!(
        local.store.get_intent_state(&i.id).await.unwrap(),
        Some(IntentState::Failed)
    );
}

#[tokio::test]
async fn test_create_then_remove_leaves_no_trace() {
    // Withdrawing straight from Submitted is only tolerated leniently.
    let (local, remote) = cluster(VerificationPolicy::Lenient);
    let i = intent();
    local.store.create_intent(&i).await.unwrap();
    local.store.set_installable_intents(&i.id, vec![i.clone()]).await.unwrap();
    local.store.set_state(&i, IntentState::Installing).await.unwrap();

    local.store.remove_intent(&i.id).await.unwrap();

    assert!(local.intents.get(&i.id).await.unwrap().is_none());
    assert!(local.states.get(&i.id).await.unwrap().is_none());
    assert!(local.installables.get(&i.id).await.unwrap().is_none());
    assert!(local.store.get_intent_state(&i.id).await.unwrap().is_none());
    assert!(remote.store.get_intent_state(&i.id).await.unwrap().is_none());
    assert_eq!(local.store.get_intent_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_strict_remove_before_parking_keeps_everything() {
    let (local, remote) = cluster(VerificationPolicy::Strict);
    let i = intent();
    local.store.create_intent(&i).await.unwrap();
    local.store.set_installable_intents(&i.id, vec![i.clone()]).await.unwrap();

    let err = local.store.remove_intent(&i.id).await.unwrap_err();

    assert!(matches!(err, SyncError::IllegalTransition { to: IntentState::Withdrawn, .. }));
    assert!(local.intents.get(&i.id).await.unwrap().is_some());
    assert!(local.installables.get(&i.id).await.unwrap().is_some());
    assert_eq!(
        remote.store.get_intent_state(&i.id).await.unwrap(),
        Some(IntentState::Submitted)
    );
}

#[tokio::test]
async fn test_duplicate_create_is_silent() {
    let (local, remote) = cluster(VerificationPolicy::Strict);
    let i = intent();

    assert!(local.store.create_intent(&i).await.unwrap().is_some());
    assert!(local.store.create_intent(&i).await.unwrap().is_none());
    assert!(remote.store.create_intent(&i).await.unwrap().is_none());
    assert_eq!(remote.store.get_intent_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_remote_transition_reaches_manager_listeners() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut controllers = Vec::new();
    for node in ["node-1", "node-2"] {
        let node_id = NodeId::new(node);
        let flow_adapters = Arc::new(AdapterRegistry::new());
        flow_adapters.register(DeviceId::new("of:1"), Arc::new(MockDeviceAdapter::new("mock")));
        let controller = SyncController::build(
            SyncConfig {
                local_node: node.to_string(),
                ..SyncConfig::default()
            },
            SyncDeps {
                maps: SyncMaps::open(&storage.for_node(node_id.clone())).unwrap(),
                flow_adapters,
                group_adapters: Arc::new(AdapterRegistry::new()),
                mastership: Arc::new(StaticMastership::new(node_id)),
                clock: Arc::new(ManualClock::new(0)),
            },
        )
        .unwrap();
        controllers.push(controller);
    }
    let observed = Arc::new(CollectingListener::new());
    controllers[1].intent_manager().add_listener(observed.clone());

    let i = intent();
    let state = controllers[0].intent_manager().submit(i.clone()).await.unwrap();
    assert_eq!(state, IntentState::Installed);
    controllers[0].intent_manager().withdraw(&i.id).await.unwrap();
    controllers[1].flush_events().await;

    assert_eq!(
        observed.events(),
        vec![
            IntentEvent::Submitted(i.clone()),
            IntentEvent::Installed(i.clone()),
            IntentEvent::Withdrawn(i),
        ]
    );
}
