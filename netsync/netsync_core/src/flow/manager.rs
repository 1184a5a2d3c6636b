//! Flow rule reconciliation.
//!
//! The manager keeps the flow table in the store and the tables on the
//! devices converging. User requests write the store first and push to the
//! device when this node masters it; device reports are then diffed against
//! the store:
//!
//! - reported and stored: liveness check, then merge counters or expire
//! - reported, not stored: extraneous, removed from the device
//! - stored, not reported: finalised if on its way out, re-pushed otherwise
//!
//! Adapter calls are fire-and-forget. Anything that does not stick is
//! corrected by the next report.

use std::collections::HashMap;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn, Instrument};

use device_adapter_interface::{AdapterRegistry, DeviceAdapter};
use netsync_shared_types::{
    ApplicationId, BatchOperation, DeviceId, FlowEntry, FlowEntryState, FlowKey, FlowRule,
    FlowRuleEvent, Result, SyncError,
};
use observability::{device_span, EventDispatcher, EventListener, ListenerId};
use state_store_interface::StoreDelegate;

use crate::batch::{self, BatchFuture};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::flow::liveness::LivenessTracker;
use crate::flow::store::FlowRuleStore;
use crate::mastership::MastershipService;

pub type FlowRuleBatchFuture = BatchFuture<FlowRule, FlowRuleStore>;

pub struct FlowRuleManager {
    store: Arc<FlowRuleStore>,
    adapters: Arc<AdapterRegistry<FlowRule>>,
    mastership: Arc<dyn MastershipService>,
    clock: Arc<dyn Clock>,
    liveness: LivenessTracker,
    dispatcher: Arc<EventDispatcher<FlowRuleEvent>>,
    batch_timeout: Duration,
}

impl FlowRuleManager {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<FlowRuleStore>,
        adapters: Arc<AdapterRegistry<FlowRule>>,
        mastership: Arc<dyn MastershipService>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::with_capacity(
            "flow-rules",
            config.event_queue_capacity,
        ));
        store.set_delegate(Arc::new(FlowStoreDelegate {
            adapters: Arc::clone(&adapters),
            dispatcher: Arc::clone(&dispatcher),
        }));
        Self {
            store,
            adapters,
            mastership,
            clock,
            liveness: LivenessTracker::new(config.liveness_bootstrap),
            dispatcher,
            batch_timeout: config.batch_timeout(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher<FlowRuleEvent>> {
        &self.dispatcher
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<FlowRuleEvent>>) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    /// Stores each rule and pushes it to its device when mastered here.
    ///
    /// Every device must have an adapter; otherwise nothing is written.
    pub async fn apply_flow_rules(&self, rules: &[FlowRule]) -> Result<()> {
        let adapters = self.resolve(rules)?;
        for (rule, adapter) in rules.iter().zip(adapters) {
            if let Some(event) = self.store.store_flow_rule(rule).await? {
                debug!(device_id = %rule.device_id, flow_id = %rule.id, "Applying flow rule");
                adapter.apply_entries(&rule.device_id, slice::from_ref(rule));
                self.dispatcher.post(event);
            }
        }
        Ok(())
    }

    /// Marks each rule for removal and removes it from its device when
    /// mastered here.
    pub async fn remove_flow_rules(&self, rules: &[FlowRule]) -> Result<()> {
        let adapters = self.resolve(rules)?;
        for (rule, adapter) in rules.iter().zip(adapters) {
            self.remove_one(adapter.as_ref(), rule).await?;
        }
        Ok(())
    }

    /// Removes every rule owned by `app_id`.
    pub async fn remove_flow_rules_by_id(&self, app_id: &ApplicationId) -> Result<()> {
        let rules: Vec<FlowRule> = self
            .store
            .get_flow_entries_by_app(app_id)
            .await?
            .into_iter()
            .map(|entry| entry.rule)
            .collect();
        info!(app_id = %app_id, count = rules.len(), "Removing flow rules by owner");
        self.remove_flow_rules(&rules).await
    }

    pub async fn get_flow_entries(&self, device_id: &DeviceId) -> Result<Vec<FlowEntry>> {
        self.store.get_flow_entries(device_id).await
    }

    pub async fn get_flow_rules_by_id(&self, app_id: &ApplicationId) -> Result<Vec<FlowRule>> {
        Ok(self
            .store
            .get_flow_entries_by_app(app_id)
            .await?
            .into_iter()
            .map(|entry| entry.rule)
            .collect())
    }

    pub async fn flow_rule_count(&self) -> Result<usize> {
        self.store.flow_rule_count().await
    }

    /// Submits a batch through the batch coordinator.
    pub async fn apply_batch(&self, batch: BatchOperation<FlowRule>) -> Result<FlowRuleBatchFuture> {
        batch::submit(&self.adapters, Arc::clone(&self.store), batch, self.batch_timeout).await
    }

    /// Reconciles the store against a full report of a device's flow table.
    ///
    /// Entries are handled in the order reported. A failure on one entry is
    /// logged and the rest of the report is still processed.
    pub async fn push_flow_metrics(&self, device_id: &DeviceId, reported: Vec<FlowEntry>) -> Result<()> {
        let adapter = self.adapters.get(device_id)?;
        let span = device_span!("push_flow_metrics", device_id);
        async move {
            let mut missing: HashMap<FlowKey, FlowEntry> = self
                .store
                .get_flow_entries(device_id)
                .await?
                .into_iter()
                .map(|entry| (entry.key(), entry))
                .collect();
            debug!(reported = reported.len(), stored = missing.len(), "Reconciling flow table");

            for entry in &reported {
                if entry.device_id() != device_id {
                    warn!(reported_device = %entry.device_id(), "Ignoring flow reported for another device");
                    continue;
                }
                match missing.remove(&entry.key()) {
                    Some(stored) => {
                        if let Err(e) = self.flow_added(adapter.as_ref(), entry, stored).await {
                            warn!(flow_id = %entry.rule.id, error = %e, "Failed to reconcile reported flow");
                        }
                    }
                    None => {
                        debug!(flow_id = %entry.rule.id, "Removing extraneous flow");
                        adapter.remove_entries(device_id, slice::from_ref(&entry.rule));
                    }
                }
            }

            for (_, stored) in missing {
                let flow_id = stored.rule.id;
                if let Err(e) = self.flow_missing(adapter.as_ref(), stored).await {
                    warn!(flow_id = %flow_id, error = %e, "Failed to reconcile missing flow");
                }
            }
            Ok::<_, SyncError>(())
        }
        .instrument(span)
        .await
    }

    /// Handles a device telling us a flow is gone.
    ///
    /// Flows we still want are pushed back; flows on their way out are
    /// finalised. Unknown flows are ignored.
    pub async fn flow_removed(&self, removed: &FlowEntry) -> Result<()> {
        let adapter = self.adapters.get(removed.device_id())?;
        let key = removed.key();
        self.liveness.forget(&key);

        let Some(stored) = self.store.get_flow_entry(&key).await? else {
            debug!(device_id = %removed.device_id(), flow_id = %removed.rule.id, "Removal reported for unknown flow");
            return Ok(());
        };
        match stored.state {
            FlowEntryState::PendingAdd | FlowEntryState::Added => {
                info!(device_id = %removed.device_id(), flow_id = %stored.rule.id, "Device dropped a wanted flow, re-applying");
                adapter.apply_entries(removed.device_id(), slice::from_ref(&stored.rule));
            }
            FlowEntryState::PendingRemove | FlowEntryState::Removed => {
                if let Some(event) = self.store.remove_flow_rule(&key).await? {
                    self.dispatcher.post(event);
                }
            }
            FlowEntryState::Failed => {}
        }
        Ok(())
    }

    async fn flow_added(&self, adapter: &dyn DeviceAdapter<FlowRule>, reported: &FlowEntry, stored: FlowEntry) -> Result<()> {
        if matches!(stored.state, FlowEntryState::PendingRemove | FlowEntryState::Removed) {
            debug!(flow_id = %stored.rule.id, "Flow pending removal still installed, removing again");
            adapter.remove_entries(stored.device_id(), slice::from_ref(&stored.rule));
            return Ok(());
        }

        if self.liveness.check(reported, &stored, self.clock.now_ms()) {
            if let Some(event) = self.store.add_or_update_flow_rule(reported).await? {
                self.dispatcher.post(event);
            }
            Ok(())
        } else {
            info!(flow_id = %stored.rule.id, timeout = stored.timeout(), "Flow idle past its timeout, removing");
            self.liveness.forget(&stored.key());
            self.remove_one(adapter, &stored.rule).await
        }
    }

    async fn flow_missing(&self, adapter: &dyn DeviceAdapter<FlowRule>, stored: FlowEntry) -> Result<()> {
        match stored.state {
            FlowEntryState::PendingRemove | FlowEntryState::Removed => {
                debug!(flow_id = %stored.rule.id, "Flow gone from device, finalising removal");
                self.liveness.forget(&stored.key());
                if let Some(event) = self.store.remove_flow_rule(&stored.key()).await? {
                    self.dispatcher.post(event);
                }
                adapter.remove_entries(stored.device_id(), slice::from_ref(&stored.rule));
            }
            FlowEntryState::PendingAdd | FlowEntryState::Added => {
                debug!(flow_id = %stored.rule.id, "Flow missing from device, re-applying");
                adapter.apply_entries(stored.device_id(), slice::from_ref(&stored.rule));
            }
            FlowEntryState::Failed => {
                debug!(flow_id = %stored.rule.id, "Flow was rejected by the device, not re-applying");
            }
        }
        Ok(())
    }

    async fn remove_one(&self, adapter: &dyn DeviceAdapter<FlowRule>, rule: &FlowRule) -> Result<()> {
        let event = self.store.delete_flow_rule(rule).await?;
        if self.mastership.is_local_master(&rule.device_id) {
            debug!(device_id = %rule.device_id, flow_id = %rule.id, "Removing flow rule");
            adapter.remove_entries(&rule.device_id, slice::from_ref(rule));
        }
        if let Some(event) = event {
            self.dispatcher.post(event);
        }
        Ok(())
    }

    fn resolve(&self, rules: &[FlowRule]) -> Result<Vec<Arc<dyn DeviceAdapter<FlowRule>>>> {
        rules
            .iter()
            .map(|rule| self.adapters.get(&rule.device_id))
            .collect()
    }
}

/// Acts on requests the store raises for writes made by other nodes.
struct FlowStoreDelegate {
    adapters: Arc<AdapterRegistry<FlowRule>>,
    dispatcher: Arc<EventDispatcher<FlowRuleEvent>>,
}

impl StoreDelegate<FlowRuleEvent> for FlowStoreDelegate {
    fn notify(&self, event: FlowRuleEvent) {
        let entry = event.subject();
        match self.adapters.get(entry.device_id()) {
            Ok(adapter) => match &event {
                FlowRuleEvent::RuleAddRequested(entry) => {
                    adapter.apply_entries(entry.device_id(), slice::from_ref(&entry.rule));
                }
                FlowRuleEvent::RuleRemoveRequested(entry) => {
                    adapter.remove_entries(entry.device_id(), slice::from_ref(&entry.rule));
                }
                _ => {}
            },
            Err(e) => warn!(error = %e, "Cannot act on remote flow request"),
        }
        self.dispatcher.post(event);
    }
}
