//! Intent State Store
//!
//! Two tiers of lifecycle state:
//!
//! - **Parking** states (`Submitted`, `Installed`, `Withdrawn`, `Failed`)
//!   live in a replicated map and are agreed across the cluster. Writes go
//!   through a compare-and-swap guarded by [`IntentState::can_follow`].
//! - **Transient** states (`Compiling`, `Installing`, ...) live only in this
//!   process. Every `set_state` call records its state here too, so local
//!   reads see in-flight work immediately.
//!
//! `get_intent_state` prefers the transient value. When another node writes
//! a parking state, the local transient entry is dropped so the next read
//! falls through to the replicated value.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{debug, warn};

use netsync_shared_types::{Intent, IntentEvent, IntentId, IntentState, NodeId, Result, SyncError};
use state_store_interface::{
    ConsistentMap, MapEvent, MapEventKind, MapEventListener, StoreDelegate, Versioned,
};

use crate::config::VerificationPolicy;

pub const INTENTS_MAP: &str = "netsync-intents";
pub const INTENT_STATES_MAP: &str = "netsync-intent-states";
pub const INSTALLABLE_INTENTS_MAP: &str = "netsync-installable-intents";

/// The replicated maps an [`IntentStore`] is built on.
pub struct IntentMaps {
    pub intents: Arc<dyn ConsistentMap<IntentId, Intent>>,
    pub states: Arc<dyn ConsistentMap<IntentId, IntentState>>,
    pub installables: Arc<dyn ConsistentMap<IntentId, Vec<Intent>>>,
}

type DelegateCell = Arc<OnceLock<Arc<dyn StoreDelegate<IntentEvent>>>>;

pub struct IntentStore {
    intents: Arc<dyn ConsistentMap<IntentId, Intent>>,
    states: Arc<dyn ConsistentMap<IntentId, IntentState>>,
    installables: Arc<dyn ConsistentMap<IntentId, Vec<Intent>>>,
    transient: Arc<DashMap<IntentId, IntentState>>,
    policy: VerificationPolicy,
    delegate: DelegateCell,
}

impl IntentStore {
    pub fn new(maps: IntentMaps, policy: VerificationPolicy) -> Self {
        let transient = Arc::new(DashMap::new());
        let catalogue = Arc::new(DashMap::new());
        let delegate: DelegateCell = Arc::new(OnceLock::new());

        maps.intents.add_listener(Arc::new(CatalogueMirror {
            catalogue: Arc::clone(&catalogue),
        }));
        maps.states.add_listener(Arc::new(RemoteStateListener {
            local_node: maps.states.local_node().clone(),
            transient: Arc::clone(&transient),
            catalogue,
            delegate: Arc::clone(&delegate),
        }));

        Self {
            intents: maps.intents,
            states: maps.states,
            installables: maps.installables,
            transient,
            policy,
            delegate,
        }
    }

    /// Receives events for parking transitions written by other nodes.
    /// Only the first delegate set is kept.
    pub fn set_delegate(&self, delegate: Arc<dyn StoreDelegate<IntentEvent>>) -> bool {
        self.delegate.set(delegate).is_ok()
    }

    pub fn policy(&self) -> VerificationPolicy {
        self.policy
    }

    /// Adds the intent and parks it in `Submitted`.
    ///
    /// An intent whose id is already known is left alone and yields `None`.
    pub async fn create_intent(&self, intent: &Intent) -> Result<Option<IntentEvent>> {
        if self.intents.put_if_absent(intent.id, intent.clone()).await?.is_some() {
            debug!(intent_id = %intent.id, "Intent already exists, ignoring");
            return Ok(None);
        }
        self.set_state(intent, IntentState::Submitted).await
    }

    /// Withdraws the intent and deletes it together with its installables
    /// and all state.
    ///
    /// The step to `Withdrawn` is guarded like any parking write: under
    /// [`VerificationPolicy::Strict`] an intent that may not be withdrawn
    /// yet is left untouched and `IllegalTransition` is returned. Yields
    /// `Withdrawn`, or `None` if the intent was already gone.
    pub async fn remove_intent(&self, id: &IntentId) -> Result<Option<IntentEvent>> {
        let Some(intent) = self.intents.get(id).await? else {
            return Ok(None);
        };
        let previous = self.get_parking_state(id).await?;
        self.verify(id, previous, IntentState::Withdrawn)?;
        // Parking state goes first so other nodes can still resolve the
        // intent when they see it disappear.
        self.states.remove(id).await?;
        self.installables.remove(id).await?;
        self.intents.remove(id).await?;
        self.transient.remove(id);
        debug!(intent_id = %id, "Intent removed");
        Ok(Some(IntentEvent::Withdrawn(intent.into_value())))
    }

    /// Records a lifecycle state for `intent`.
    ///
    /// Transient states only touch local memory. Parking states are written
    /// to the replicated map if the recorded parking state may be followed
    /// by `state`; under [`VerificationPolicy::Strict`] an illegal step is
    /// rejected with nothing changed, under `Lenient` it is logged and
    /// applied. A successful parking write yields its lifecycle event.
    pub async fn set_state(&self, intent: &Intent, state: IntentState) -> Result<Option<IntentEvent>> {
        if !state.is_parking() {
            self.transient.insert(intent.id, state);
            return Ok(None);
        }

        loop {
            let current = self.states.get(&intent.id).await?;
            let previous = current.as_ref().map(|versioned| versioned.value);
            self.verify(&intent.id, previous, state)?;

            let written = match current {
                None => self.states.put_if_absent(intent.id, state).await?.is_none(),
                Some(Versioned { version, .. }) => {
                    self.states.replace_version(&intent.id, version, state).await?
                }
            };
            if written {
                break;
            }
            debug!(intent_id = %intent.id, "Concurrent intent state write, retrying");
        }

        self.transient.insert(intent.id, state);
        Ok(IntentEvent::for_state(state, intent.clone()))
    }

    /// Fails with `IllegalTransition` if the current parking state may not
    /// be followed by `to` and the policy is strict. Writes nothing.
    pub async fn check_transition(&self, id: &IntentId, to: IntentState) -> Result<()> {
        let previous = self.get_parking_state(id).await?;
        if self.policy == VerificationPolicy::Strict && !to.can_follow(previous) {
            return Err(SyncError::IllegalTransition {
                intent: *id,
                from: previous,
                to,
            });
        }
        Ok(())
    }

    fn verify(&self, id: &IntentId, previous: Option<IntentState>, to: IntentState) -> Result<()> {
        if to.can_follow(previous) {
            return Ok(());
        }
        match self.policy {
            VerificationPolicy::Strict => {
                warn!(intent_id = %id, from = ?previous, to = %to, "Rejecting illegal intent state transition");
                Err(SyncError::IllegalTransition {
                    intent: *id,
                    from: previous,
                    to,
                })
            }
            VerificationPolicy::Lenient => {
                warn!(intent_id = %id, from = ?previous, to = %to, "Illegal intent state transition, applying anyway");
                Ok(())
            }
        }
    }

    /// The freshest state this process knows: transient first, then parking.
    pub async fn get_intent_state(&self, id: &IntentId) -> Result<Option<IntentState>> {
        if let Some(state) = self.transient.get(id) {
            return Ok(Some(*state.value()));
        }
        Ok(self.states.get(id).await?.map(Versioned::into_value))
    }

    /// The replicated state only.
    pub async fn get_parking_state(&self, id: &IntentId) -> Result<Option<IntentState>> {
        Ok(self.states.get(id).await?.map(Versioned::into_value))
    }

    pub async fn get_intent(&self, id: &IntentId) -> Result<Option<Intent>> {
        Ok(self.intents.get(id).await?.map(Versioned::into_value))
    }

    pub async fn get_intents(&self) -> Result<Vec<Intent>> {
        Ok(self
            .intents
            .entries()
            .await?
            .into_iter()
            .map(|(_, intent)| intent.into_value())
            .collect())
    }

    pub async fn get_intent_count(&self) -> Result<usize> {
        self.intents.size().await
    }

    pub async fn set_installable_intents(&self, id: &IntentId, installables: Vec<Intent>) -> Result<()> {
        self.installables.put(*id, installables).await?;
        Ok(())
    }

    pub async fn get_installable_intents(&self, id: &IntentId) -> Result<Option<Vec<Intent>>> {
        Ok(self.installables.get(id).await?.map(Versioned::into_value))
    }

    pub async fn remove_installed_intents(&self, id: &IntentId) -> Result<()> {
        self.installables.remove(id).await?;
        Ok(())
    }

    #[cfg(test)]
    fn has_transient(&self, id: &IntentId) -> bool {
        self.transient.contains_key(id)
    }
}

/// Keeps a local copy of intent definitions so state events written by
/// other nodes can be turned into intent events without a store round trip.
struct CatalogueMirror {
    catalogue: Arc<DashMap<IntentId, Intent>>,
}

impl MapEventListener<IntentId, Intent> for CatalogueMirror {
    fn event(&self, event: &MapEvent<IntentId, Intent>) {
        match (&event.kind, &event.new_value) {
            (MapEventKind::Remove, _) | (_, None) => {
                self.catalogue.remove(&event.key);
            }
            (_, Some(intent)) => {
                self.catalogue.insert(event.key, intent.value.clone());
            }
        }
    }
}

struct RemoteStateListener {
    local_node: NodeId,
    transient: Arc<DashMap<IntentId, IntentState>>,
    catalogue: Arc<DashMap<IntentId, Intent>>,
    delegate: DelegateCell,
}

impl MapEventListener<IntentId, IntentState> for RemoteStateListener {
    fn event(&self, event: &MapEvent<IntentId, IntentState>) {
        if !event.is_remote(&self.local_node) {
            return;
        }
        if self.transient.remove(&event.key).is_some() {
            debug!(intent_id = %event.key, origin = %event.origin, "Remote intent state write, dropped local transient state");
        }

        let state = match (&event.kind, &event.new_value) {
            (MapEventKind::Remove, _) | (_, None) => IntentState::Withdrawn,
            (_, Some(state)) => state.value,
        };
        let Some(intent) = self.catalogue.get(&event.key).map(|entry| entry.value().clone()) else {
            debug!(intent_id = %event.key, "Remote state for an intent not seen locally");
            return;
        };
        if let (Some(delegate), Some(intent_event)) =
            (self.delegate.get(), IntentEvent::for_state(state, intent))
        {
            delegate.notify(intent_event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_shared_types::{ApplicationId, IntentKind};
    use state_store_interface::InMemoryStorage;
    use std::sync::Mutex;

    fn store_on(storage: &Arc<InMemoryStorage>, node: &str, policy: VerificationPolicy) -> IntentStore {
        let node = storage.for_node(NodeId::new(node));
        IntentStore::new(
            IntentMaps {
                intents: node.consistent_map(INTENTS_MAP).unwrap(),
                states: node.consistent_map(INTENT_STATES_MAP).unwrap(),
                installables: node.consistent_map(INSTALLABLE_INTENTS_MAP).unwrap(),
            },
            policy,
        )
    }

    fn intent() -> Intent {
        Intent::new(ApplicationId::new("fwd"), 100, IntentKind::FlowRules { rules: vec![] })
    }

    #[derive(Default)]
    struct RecordingDelegate {
        events: Mutex<Vec<IntentEvent>>,
    }

    impl StoreDelegate<IntentEvent> for RecordingDelegate {
        fn notify(&self, event: IntentEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_create_is_deduplicated() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Strict);
        let i = intent();

        let first = store.create_intent(&i).await.unwrap();
        assert!(matches!(first, Some(IntentEvent::Submitted(_))));
        assert!(store.create_intent(&i).await.unwrap().is_none());
        assert_eq!(store.get_intent_count().await.unwrap(), 1);
        assert_eq!(store.get_intent_state(&i.id).await.unwrap(), Some(IntentState::Submitted));
    }

    #[tokio::test]
    async fn test_transient_state_is_local_only() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Strict);
        let i = intent();
        store.create_intent(&i).await.unwrap();

        let event = store.set_state(&i, IntentState::Compiling).await.unwrap();
        assert!(event.is_none());
        assert_eq!(store.get_intent_state(&i.id).await.unwrap(), Some(IntentState::Compiling));
        assert_eq!(store.get_parking_state(&i.id).await.unwrap(), Some(IntentState::Submitted));
    }

    #[tokio::test]
    async fn test_strict_rejects_and_leaves_state() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Strict);
        let i = intent();
        store.create_intent(&i).await.unwrap();

        let err = store.set_state(&i, IntentState::Withdrawn).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::IllegalTransition {
                from: Some(IntentState::Submitted),
                to: IntentState::Withdrawn,
                ..
            }
        ));
        assert_eq!(store.get_parking_state(&i.id).await.unwrap(), Some(IntentState::Submitted));
        assert_eq!(store.get_intent_state(&i.id).await.unwrap(), Some(IntentState::Submitted));
    }

    #[tokio::test]
    async fn test_lenient_applies_illegal_transition() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Lenient);
        let i = intent();
        store.create_intent(&i).await.unwrap();

        let event = store.set_state(&i, IntentState::Withdrawn).await.unwrap();
        assert!(matches!(event, Some(IntentEvent::Withdrawn(_))));
        assert_eq!(store.get_parking_state(&i.id).await.unwrap(), Some(IntentState::Withdrawn));
    }

    #[tokio::test]
    async fn test_remote_write_invalidates_transient() {
        let storage = Arc::new(InMemoryStorage::new());
        let local = store_on(&storage, "node-1", VerificationPolicy::Strict);
        let remote = store_on(&storage, "node-2", VerificationPolicy::Strict);
        let delegate = Arc::new(RecordingDelegate::default());
        assert!(local.set_delegate(delegate.clone()));

        let i = intent();
        local.create_intent(&i).await.unwrap();
        local.set_state(&i, IntentState::Installing).await.unwrap();
        assert!(local.has_transient(&i.id));

        remote.set_state(&i, IntentState::Installed).await.unwrap();

        assert!(!local.has_transient(&i.id));
        assert_eq!(local.get_intent_state(&i.id).await.unwrap(), Some(IntentState::Installed));
        let events = delegate.events.lock().unwrap().clone();
        assert_eq!(events, vec![IntentEvent::Installed(i.clone())]);
    }

    #[tokio::test]
    async fn test_remove_leaves_no_trace() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Strict);
        let i = intent();
        store.create_intent(&i).await.unwrap();
        store.set_installable_intents(&i.id, vec![i.clone()]).await.unwrap();
        store.set_state(&i, IntentState::Installed).await.unwrap();
        store.set_state(&i, IntentState::Withdrawing).await.unwrap();

        let event = store.remove_intent(&i.id).await.unwrap();
        assert_eq!(event, Some(IntentEvent::Withdrawn(i.clone())));
        assert!(store.get_intent(&i.id).await.unwrap().is_none());
        assert!(store.get_intent_state(&i.id).await.unwrap().is_none());
        assert!(store.get_installable_intents(&i.id).await.unwrap().is_none());
        assert!(store.remove_intent(&i.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_strict_remove_of_submitted_intent_is_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Strict);
        let i = intent();
        store.create_intent(&i).await.unwrap();
        store.set_installable_intents(&i.id, vec![i.clone()]).await.unwrap();

        let err = store.remove_intent(&i.id).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::IllegalTransition {
                from: Some(IntentState::Submitted),
                to: IntentState::Withdrawn,
                ..
            }
        ));
        assert!(matches!(
            store.check_transition(&i.id, IntentState::Withdrawn).await,
            Err(SyncError::IllegalTransition { .. })
        ));
        assert_eq!(store.get_intent(&i.id).await.unwrap(), Some(i.clone()));
        assert_eq!(store.get_parking_state(&i.id).await.unwrap(), Some(IntentState::Submitted));
        assert_eq!(store.get_installable_intents(&i.id).await.unwrap(), Some(vec![i.clone()]));
    }

    #[tokio::test]
    async fn test_lenient_remove_of_submitted_intent_cleans_up() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Lenient);
        let i = intent();
        store.create_intent(&i).await.unwrap();
        store.check_transition(&i.id, IntentState::Withdrawn).await.unwrap();

        let event = store.remove_intent(&i.id).await.unwrap();
        assert_eq!(event, Some(IntentEvent::Withdrawn(i.clone())));
        assert!(store.get_intent(&i.id).await.unwrap().is_none());
        assert!(store.get_intent_state(&i.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_installables_crud() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_on(&storage, "node-1", VerificationPolicy::Strict);
        let id = IntentId::new();
        let compiled = vec![intent(), intent()];

        store.set_installable_intents(&id, compiled.clone()).await.unwrap();
        assert_eq!(store.get_installable_intents(&id).await.unwrap(), Some(compiled));
        store.remove_installed_intents(&id).await.unwrap();
        assert!(store.get_installable_intents(&id).await.unwrap().is_none());
    }
}
