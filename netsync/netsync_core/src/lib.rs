pub mod batch;
pub mod clock;
pub mod config;
pub mod flow;
pub mod group;
pub mod intent;
pub mod mastership;

use std::sync::Arc;

use tracing::info;

use device_adapter_interface::AdapterRegistry;
use netsync_shared_types::{
    FlowEntry, FlowKey, FlowRule, GroupDescription, GroupEntry, Intent, IntentId, IntentState,
    Result,
};
use state_store_interface::{ConsistentMap, NodeStorage};

pub use batch::{BatchFuture, BatchStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LivenessBootstrap, SyncConfig, VerificationPolicy};
pub use flow::{FlowRuleBatchFuture, FlowRuleManager, FlowRuleStore, FLOW_TABLE_MAP};
pub use group::{GroupBatchFuture, GroupManager, GroupStore, GroupStoreKey, GROUP_TABLE_MAP};
pub use intent::{
    IntentCompiler, IntentManager, IntentMaps, IntentStore, PointToPointCompiler,
    INSTALLABLE_INTENTS_MAP, INTENTS_MAP, INTENT_STATES_MAP,
};
pub use mastership::{MastershipService, StaticMastership};

/// Every replicated map the controller works on.
pub struct SyncMaps {
    pub flows: Arc<dyn ConsistentMap<FlowKey, FlowEntry>>,
    pub groups: Arc<dyn ConsistentMap<GroupStoreKey, GroupEntry>>,
    pub intents: IntentMaps,
}

impl SyncMaps {
    /// Opens the maps under their well-known names.
    pub fn open(storage: &NodeStorage) -> Result<Self> {
        Ok(Self {
            flows: storage.consistent_map(FLOW_TABLE_MAP)?,
            groups: storage.consistent_map(GROUP_TABLE_MAP)?,
            intents: IntentMaps {
                intents: storage.consistent_map::<IntentId, Intent>(INTENTS_MAP)?,
                states: storage.consistent_map::<IntentId, IntentState>(INTENT_STATES_MAP)?,
                installables: storage
                    .consistent_map::<IntentId, Vec<Intent>>(INSTALLABLE_INTENTS_MAP)?,
            },
        })
    }
}

/// External collaborators a controller instance is built from.
pub struct SyncDeps {
    pub maps: SyncMaps,
    pub flow_adapters: Arc<AdapterRegistry<FlowRule>>,
    pub group_adapters: Arc<AdapterRegistry<GroupDescription>>,
    pub mastership: Arc<dyn MastershipService>,
    pub clock: Arc<dyn Clock>,
}

/// One controller process: the flow, group and intent managers sharing a
/// configuration and a view of the cluster.
pub struct SyncController {
    config: SyncConfig,
    flow_manager: Arc<FlowRuleManager>,
    group_manager: Arc<GroupManager>,
    intent_manager: Arc<IntentManager>,
}

impl SyncController {
    /// Wires stores and managers together. Must be called from within a
    /// Tokio runtime, since every manager starts its event dispatcher.
    pub fn build(config: SyncConfig, deps: SyncDeps) -> Result<Self> {
        config.validate()?;
        let SyncDeps {
            maps,
            flow_adapters,
            group_adapters,
            mastership,
            clock,
        } = deps;

        let flow_store = Arc::new(FlowRuleStore::new(
            maps.flows,
            Arc::clone(&mastership),
            Arc::clone(&clock),
        ));
        let flow_manager = Arc::new(FlowRuleManager::new(
            flow_store,
            flow_adapters,
            Arc::clone(&mastership),
            clock,
            &config,
        ));

        let group_store = Arc::new(GroupStore::new(maps.groups, Arc::clone(&mastership)));
        let group_manager = Arc::new(GroupManager::new(
            group_store,
            group_adapters,
            mastership,
            &config,
        ));

        let intent_store = Arc::new(IntentStore::new(maps.intents, config.verification_policy));
        let intent_manager = Arc::new(IntentManager::new(
            intent_store,
            Arc::clone(&flow_manager),
            &config,
        ));
        intent_manager.register_compiler("point-to-point", Arc::new(PointToPointCompiler));

        info!(
            node = %config.local_node,
            policy = ?config.verification_policy,
            liveness_bootstrap = ?config.liveness_bootstrap,
            "Sync controller built"
        );
        Ok(Self {
            config,
            flow_manager,
            group_manager,
            intent_manager,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn flow_manager(&self) -> &Arc<FlowRuleManager> {
        &self.flow_manager
    }

    pub fn group_manager(&self) -> &Arc<GroupManager> {
        &self.group_manager
    }

    pub fn intent_manager(&self) -> &Arc<IntentManager> {
        &self.intent_manager
    }

    /// Waits until every event posted so far has reached its listeners.
    pub async fn flush_events(&self) {
        self.flow_manager.dispatcher().flush().await;
        self.group_manager.dispatcher().flush().await;
        self.intent_manager.dispatcher().flush().await;
    }
}
