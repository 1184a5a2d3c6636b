//! Replicated flow rule store.
//!
//! Entries are keyed by `(device, flow id)` in a [`ConsistentMap`]. Writes
//! made here for devices this node masters come back as events the caller
//! acts on; writes that arrive from other nodes for devices this node
//! masters are handed to the store delegate instead.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use netsync_shared_types::{
    ApplicationId, DeviceId, FlowEntry, FlowEntryState, FlowKey, FlowRule, FlowRuleEvent, Result,
};
use state_store_interface::{
    ConsistentMap, MapEvent, MapEventKind, MapEventListener, StoreDelegate, Versioned,
};

use crate::batch::BatchStore;
use crate::clock::Clock;
use crate::mastership::MastershipService;

pub const FLOW_TABLE_MAP: &str = "netsync-flow-table";

pub struct FlowRuleStore {
    entries: Arc<dyn ConsistentMap<FlowKey, FlowEntry>>,
    mastership: Arc<dyn MastershipService>,
    clock: Arc<dyn Clock>,
}

impl FlowRuleStore {
    pub fn new(
        entries: Arc<dyn ConsistentMap<FlowKey, FlowEntry>>,
        mastership: Arc<dyn MastershipService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries,
            mastership,
            clock,
        }
    }

    /// Routes remote writes for locally mastered devices to `delegate`.
    pub fn set_delegate(&self, delegate: Arc<dyn StoreDelegate<FlowRuleEvent>>) {
        self.entries.add_listener(Arc::new(RemoteFlowListener {
            local_node: self.entries.local_node().clone(),
            mastership: Arc::clone(&self.mastership),
            delegate,
        }));
    }

    /// Records `rule` as intended.
    ///
    /// An entry that is already pending or installed is left as it is, so
    /// repeating the call changes nothing. Returns `RuleAddRequested` when
    /// this node masters the device and must push the rule down.
    pub async fn store_flow_rule(&self, rule: &FlowRule) -> Result<Option<FlowRuleEvent>> {
        let key = rule.flow_key();
        let pending = FlowEntry::pending(rule.clone(), self.clock.now_ms());
        let entry = match self.entries.put_if_absent(key.clone(), pending.clone()).await? {
            None => pending,
            Some(existing) if is_intended(existing.value.state) && existing.value.rule == *rule => {
                existing.value
            }
            Some(_) => {
                self.entries.put(key, pending.clone()).await?;
                pending
            }
        };
        Ok(self.local_event(&rule.device_id, FlowRuleEvent::RuleAddRequested(entry)))
    }

    /// Marks the stored entry for `rule` as pending removal.
    ///
    /// The entry stays in the store until the device stops reporting it.
    pub async fn delete_flow_rule(&self, rule: &FlowRule) -> Result<Option<FlowRuleEvent>> {
        let key = rule.flow_key();
        loop {
            let Some(current) = self.entries.get(&key).await? else {
                return Ok(None);
            };
            if current.value.state == FlowEntryState::PendingRemove {
                return Ok(self.local_event(
                    &rule.device_id,
                    FlowRuleEvent::RuleRemoveRequested(current.value),
                ));
            }
            let marked = current.value.with_state(FlowEntryState::PendingRemove);
            if self
                .entries
                .replace_version(&key, current.version, marked.clone())
                .await?
            {
                return Ok(self.local_event(
                    &rule.device_id,
                    FlowRuleEvent::RuleRemoveRequested(marked),
                ));
            }
            trace!(key = ?key, "Concurrent update while marking flow for removal, retrying");
        }
    }

    /// Merges the counters of a reported entry into the stored one.
    ///
    /// The first report of a pending entry confirms it (`RuleAdded`); later
    /// reports refresh it (`RuleUpdated`). Unknown entries yield `None`.
    pub async fn add_or_update_flow_rule(&self, reported: &FlowEntry) -> Result<Option<FlowRuleEvent>> {
        let key = reported.key();
        loop {
            let Some(current) = self.entries.get(&key).await? else {
                return Ok(None);
            };
            let refreshed = current.value.with_counters_from(reported, self.clock.now_ms());
            let (updated, event): (FlowEntry, fn(FlowEntry) -> FlowRuleEvent) =
                if current.value.state == FlowEntryState::PendingAdd {
                    (refreshed.with_state(FlowEntryState::Added), FlowRuleEvent::RuleAdded)
                } else {
                    (refreshed, FlowRuleEvent::RuleUpdated)
                };
            if self
                .entries
                .replace_version(&key, current.version, updated.clone())
                .await?
            {
                return Ok(Some(event(updated)));
            }
            trace!(key = ?key, "Concurrent update while merging flow counters, retrying");
        }
    }

    /// Deletes the entry outright.
    pub async fn remove_flow_rule(&self, key: &FlowKey) -> Result<Option<FlowRuleEvent>> {
        Ok(self
            .entries
            .remove(key)
            .await?
            .map(|removed| FlowRuleEvent::RuleRemoved(removed.into_value().with_state(FlowEntryState::Removed))))
    }

    pub async fn get_flow_entry(&self, key: &FlowKey) -> Result<Option<FlowEntry>> {
        Ok(self.entries.get(key).await?.map(Versioned::into_value))
    }

    pub async fn get_flow_entries(&self, device_id: &DeviceId) -> Result<Vec<FlowEntry>> {
        Ok(self
            .entries
            .entries()
            .await?
            .into_iter()
            .filter(|(key, _)| &key.device_id == device_id)
            .map(|(_, entry)| entry.into_value())
            .collect())
    }

    pub async fn get_flow_entries_by_app(&self, app_id: &ApplicationId) -> Result<Vec<FlowEntry>> {
        Ok(self
            .entries
            .entries()
            .await?
            .into_iter()
            .filter(|(_, entry)| &entry.value.rule.app_id == app_id)
            .map(|(_, entry)| entry.into_value())
            .collect())
    }

    pub async fn flow_rule_count(&self) -> Result<usize> {
        self.entries.size().await
    }

    fn local_event(&self, device_id: &DeviceId, event: FlowRuleEvent) -> Option<FlowRuleEvent> {
        if self.mastership.is_local_master(device_id) {
            Some(event)
        } else {
            debug!(device_id = %device_id, "Device mastered elsewhere, not pushing locally");
            None
        }
    }
}

fn is_intended(state: FlowEntryState) -> bool {
    matches!(state, FlowEntryState::PendingAdd | FlowEntryState::Added)
}

#[async_trait]
impl BatchStore<FlowRule> for FlowRuleStore {
    type Stored = FlowEntry;

    async fn provision_add(&self, target: &FlowRule) -> Result<Option<FlowEntry>> {
        let pending = FlowEntry::pending(target.clone(), self.clock.now_ms());
        Ok(self
            .entries
            .put(target.flow_key(), pending)
            .await?
            .map(Versioned::into_value))
    }

    async fn provision_remove(&self, target: &FlowRule) -> Result<Option<FlowEntry>> {
        let key = target.flow_key();
        let Some(current) = self.entries.get(&key).await? else {
            return Ok(None);
        };
        self.entries
            .put(key, current.value.with_state(FlowEntryState::PendingRemove))
            .await?;
        Ok(Some(current.value))
    }

    async fn revoke(&self, target: &FlowRule) -> Result<()> {
        self.entries.remove(&target.flow_key()).await?;
        Ok(())
    }

    async fn restore(&self, stored: FlowEntry) -> Result<()> {
        self.entries.put(stored.key(), stored).await?;
        Ok(())
    }
}

/// Turns state changes written by other nodes into requests for the master.
struct RemoteFlowListener {
    local_node: netsync_shared_types::NodeId,
    mastership: Arc<dyn MastershipService>,
    delegate: Arc<dyn StoreDelegate<FlowRuleEvent>>,
}

impl MapEventListener<FlowKey, FlowEntry> for RemoteFlowListener {
    fn event(&self, event: &MapEvent<FlowKey, FlowEntry>) {
        if !event.is_remote(&self.local_node) || !self.mastership.is_local_master(&event.key.device_id) {
            return;
        }
        if event.kind == MapEventKind::Remove {
            return;
        }
        let Some(new) = &event.new_value else {
            return;
        };
        let old_state = event.old_value.as_ref().map(|old| old.value.state);
        if old_state == Some(new.value.state) {
            return;
        }
        let request = match new.value.state {
            FlowEntryState::PendingAdd => FlowRuleEvent::RuleAddRequested(new.value.clone()),
            FlowEntryState::PendingRemove => FlowRuleEvent::RuleRemoveRequested(new.value.clone()),
            _ => return,
        };
        debug!(origin = %event.origin, key = ?event.key, "Remote flow write for a local device");
        self.delegate.notify(request);
    }
}
