//! Intent lifecycle driver.
//!
//! `submit` walks an intent from `Submitted` through the transient
//! `Compiling` and `Installing` steps to `Installed` or `Failed`.
//! Compilation turns a high-level intent into installable flow-rule
//! intents; installation pushes their rules through the flow rule batch
//! coordinator so a partial failure is rolled back before the intent parks
//! in `Failed`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn, Instrument};

use netsync_shared_types::{
    BatchOperation, FlowRule, Intent, IntentEvent, IntentId, IntentKind, IntentState, Result,
    SyncError, TrafficTreatment,
};
use observability::{intent_span, EventDispatcher, EventListener, ListenerId};
use state_store_interface::StoreDelegate;

use crate::config::SyncConfig;
use crate::flow::FlowRuleManager;
use crate::intent::store::IntentStore;

/// Turns an intent into installable intents.
#[async_trait]
pub trait IntentCompiler: Send + Sync {
    async fn compile(&self, intent: &Intent) -> Result<Vec<Intent>>;
}

/// Compiles a point-to-point intent whose two ends sit on the same device
/// into a single forwarding rule.
pub struct PointToPointCompiler;

#[async_trait]
impl IntentCompiler for PointToPointCompiler {
    async fn compile(&self, intent: &Intent) -> Result<Vec<Intent>> {
        let IntentKind::PointToPoint {
            ingress,
            egress,
            selector,
        } = &intent.kind
        else {
            return Err(SyncError::CompilationError(format!(
                "{} is not a point-to-point intent",
                intent.id
            )));
        };
        if ingress.device_id != egress.device_id {
            return Err(SyncError::CompilationError(format!(
                "no path from {} to {}",
                ingress.device_id, egress.device_id
            )));
        }

        let rule = FlowRule::new(
            ingress.device_id.clone(),
            intent.app_id.clone(),
            intent.priority,
            selector.clone().matching("in_port", ingress.port.to_string()),
            TrafficTreatment::new().instruction(format!("output:{}", egress.port)),
        );
        Ok(vec![Intent::new(
            intent.app_id.clone(),
            intent.priority,
            IntentKind::FlowRules { rules: vec![rule] },
        )])
    }
}

pub struct IntentManager {
    store: Arc<IntentStore>,
    flows: Arc<FlowRuleManager>,
    compilers: DashMap<&'static str, Arc<dyn IntentCompiler>>,
    dispatcher: Arc<EventDispatcher<IntentEvent>>,
}

impl IntentManager {
    /// Must be called from within a Tokio runtime.
    pub fn new(store: Arc<IntentStore>, flows: Arc<FlowRuleManager>, config: &SyncConfig) -> Self {
        let dispatcher = Arc::new(EventDispatcher::with_capacity(
            "intents",
            config.event_queue_capacity,
        ));
        if !store.set_delegate(Arc::new(IntentStoreDelegate {
            dispatcher: Arc::clone(&dispatcher),
        })) {
            warn!("Intent store already has a delegate, remote intent events will not reach this manager");
        }
        Self {
            store,
            flows,
            compilers: DashMap::new(),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher<IntentEvent>> {
        &self.dispatcher
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<IntentEvent>>) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    /// Registers the compiler for intents whose kind is called `kind`,
    /// replacing any previous one.
    pub fn register_compiler(&self, kind: &'static str, compiler: Arc<dyn IntentCompiler>) {
        self.compilers.insert(kind, compiler);
    }

    pub fn unregister_compiler(&self, kind: &str) -> bool {
        self.compilers.remove(kind).is_some()
    }

    /// Submits `intent` and drives it to a parking state.
    ///
    /// Returns the state the intent ended in. Submitting an id that is
    /// already known changes nothing and returns its current state.
    pub async fn submit(&self, intent: Intent) -> Result<IntentState> {
        let span = intent_span!("submit", intent.id);
        async move {
            let Some(event) = self.store.create_intent(&intent).await? else {
                return self
                    .store
                    .get_intent_state(&intent.id)
                    .await?
                    .ok_or(SyncError::IntentNotFound(intent.id));
            };
            self.dispatcher.post(event);

            self.store.set_state(&intent, IntentState::Compiling).await?;
            let installables = match self.compile(&intent).await {
                Ok(installables) => installables,
                Err(e) => {
                    warn!(error = %e, "Intent compilation failed");
                    return self.park(&intent, IntentState::Failed).await;
                }
            };
            self.store
                .set_installable_intents(&intent.id, installables.clone())
                .await?;

            self.store.set_state(&intent, IntentState::Installing).await?;
            let batch = installables
                .iter()
                .flat_map(Intent::flow_rules)
                .cloned()
                .fold(BatchOperation::new(), BatchOperation::add);
            let state = if self.run_batch(batch).await {
                IntentState::Installed
            } else {
                IntentState::Failed
            };
            info!(state = %state, "Intent submission finished");
            self.park(&intent, state).await
        }
        .instrument(span)
        .await
    }

    /// Removes the intent's installed rules, then the intent itself.
    ///
    /// If the rules cannot be removed the batch is rolled back and the
    /// intent parks in `Failed` instead.
    pub async fn withdraw(&self, id: &IntentId) -> Result<IntentState> {
        let intent = self
            .store
            .get_intent(id)
            .await?
            .ok_or(SyncError::IntentNotFound(*id))?;
        let span = intent_span!("withdraw", intent.id);
        async move {
            self.store.check_transition(&intent.id, IntentState::Withdrawn).await?;
            self.store.set_state(&intent, IntentState::Withdrawing).await?;

            let batch = self
                .store
                .get_installable_intents(&intent.id)
                .await?
                .unwrap_or_default()
                .iter()
                .flat_map(Intent::flow_rules)
                .cloned()
                .fold(BatchOperation::new(), BatchOperation::remove);
            if !self.run_batch(batch).await {
                warn!("Could not remove installed rules, keeping intent");
                return self.park(&intent, IntentState::Failed).await;
            }

            if let Some(event) = self.store.remove_intent(&intent.id).await? {
                self.dispatcher.post(event);
            }
            info!("Intent withdrawn");
            Ok(IntentState::Withdrawn)
        }
        .instrument(span)
        .await
    }

    pub async fn get_intent(&self, id: &IntentId) -> Result<Option<Intent>> {
        self.store.get_intent(id).await
    }

    pub async fn get_intents(&self) -> Result<Vec<Intent>> {
        self.store.get_intents().await
    }

    pub async fn get_intent_state(&self, id: &IntentId) -> Result<Option<IntentState>> {
        self.store.get_intent_state(id).await
    }

    pub async fn get_installable_intents(&self, id: &IntentId) -> Result<Vec<Intent>> {
        Ok(self
            .store
            .get_installable_intents(id)
            .await?
            .unwrap_or_default())
    }

    pub async fn get_intent_count(&self) -> Result<usize> {
        self.store.get_intent_count().await
    }

    async fn compile(&self, intent: &Intent) -> Result<Vec<Intent>> {
        if intent.is_installable() {
            return Ok(vec![intent.clone()]);
        }
        let kind = intent.kind.name();
        let compiler = self
            .compilers
            .get(kind)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SyncError::CompilationError(format!("no compiler for {kind} intents")))?;
        let installables = compiler.compile(intent).await?;
        debug!(count = installables.len(), "Compiled intent");
        Ok(installables)
    }

    /// Runs a flow rule batch to completion. True if every item succeeded.
    async fn run_batch(&self, batch: BatchOperation<FlowRule>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let future = match self.flows.apply_batch(batch).await {
            Ok(future) => future,
            Err(e) => {
                warn!(error = %e, "Flow rule batch rejected");
                return false;
            }
        };
        match future.get_default().await {
            Ok(completed) if completed.success => true,
            Ok(completed) => {
                warn!(failed = completed.failed_items.len(), "Flow rule batch partially failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "Flow rule batch did not complete");
                future.cancel().await;
                false
            }
        }
    }

    async fn park(&self, intent: &Intent, state: IntentState) -> Result<IntentState> {
        if let Some(event) = self.store.set_state(intent, state).await? {
            self.dispatcher.post(event);
        }
        Ok(state)
    }
}

/// Surfaces parking transitions made by other nodes.
struct IntentStoreDelegate {
    dispatcher: Arc<EventDispatcher<IntentEvent>>,
}

impl StoreDelegate<IntentEvent> for IntentStoreDelegate {
    fn notify(&self, event: IntentEvent) {
        self.dispatcher.post(event);
    }
}
