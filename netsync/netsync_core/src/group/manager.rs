//! Group reconciliation.
//!
//! Same shape as flow reconciliation without liveness: groups never idle
//! out, they only disappear when asked to.

use std::collections::HashMap;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn, Instrument};

use device_adapter_interface::{AdapterRegistry, DeviceAdapter};
use netsync_shared_types::{
    ApplicationId, BatchOperation, DeviceId, GroupDescription, GroupEntry, GroupEvent,
    GroupOperation, GroupOperationKind, GroupState, Result, SyncError,
};
use observability::{device_span, EventDispatcher, EventListener, ListenerId};
use state_store_interface::StoreDelegate;

use crate::batch::{self, BatchFuture};
use crate::config::SyncConfig;
use crate::group::store::{GroupStore, GroupStoreKey};
use crate::mastership::MastershipService;

pub type GroupBatchFuture = BatchFuture<GroupDescription, GroupStore>;

pub struct GroupManager {
    store: Arc<GroupStore>,
    adapters: Arc<AdapterRegistry<GroupDescription>>,
    mastership: Arc<dyn MastershipService>,
    dispatcher: Arc<EventDispatcher<GroupEvent>>,
    batch_timeout: Duration,
}

impl GroupManager {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<GroupStore>,
        adapters: Arc<AdapterRegistry<GroupDescription>>,
        mastership: Arc<dyn MastershipService>,
        config: &SyncConfig,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::with_capacity(
            "groups",
            config.event_queue_capacity,
        ));
        store.set_delegate(Arc::new(GroupStoreDelegate {
            adapters: Arc::clone(&adapters),
            dispatcher: Arc::clone(&dispatcher),
        }));
        Self {
            store,
            adapters,
            mastership,
            dispatcher,
            batch_timeout: config.batch_timeout(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher<GroupEvent>> {
        &self.dispatcher
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<GroupEvent>>) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    pub async fn add_groups(&self, descriptions: &[GroupDescription]) -> Result<()> {
        let adapters = self.resolve(descriptions)?;
        for (description, adapter) in descriptions.iter().zip(adapters) {
            if let Some(event) = self.store.store_group_description(description).await? {
                debug!(device_id = %description.device_id, group = %description.key, "Adding group");
                adapter.apply_entries(&description.device_id, slice::from_ref(description));
                self.dispatcher.post(event);
            }
        }
        Ok(())
    }

    /// Replaces an existing group's buckets and re-pushes it.
    pub async fn update_group(&self, description: &GroupDescription) -> Result<()> {
        let adapter = self.adapters.get(&description.device_id)?;
        if let Some(event) = self.store.update_group_description(description).await? {
            debug!(device_id = %description.device_id, group = %description.key, "Updating group");
            adapter.apply_entries(&description.device_id, slice::from_ref(description));
            self.dispatcher.post(event);
        }
        Ok(())
    }

    pub async fn remove_groups(&self, descriptions: &[GroupDescription]) -> Result<()> {
        let adapters = self.resolve(descriptions)?;
        for (description, adapter) in descriptions.iter().zip(adapters) {
            self.remove_one(adapter.as_ref(), description).await?;
        }
        Ok(())
    }

    pub async fn remove_groups_by_id(&self, app_id: &ApplicationId) -> Result<()> {
        let descriptions: Vec<GroupDescription> = self
            .store
            .get_groups_by_app(app_id)
            .await?
            .into_iter()
            .map(|entry| entry.description)
            .collect();
        info!(app_id = %app_id, count = descriptions.len(), "Removing groups by owner");
        self.remove_groups(&descriptions).await
    }

    pub async fn get_group(&self, key: &GroupStoreKey) -> Result<Option<GroupEntry>> {
        self.store.get_group(key).await
    }

    pub async fn get_groups(&self, device_id: &DeviceId) -> Result<Vec<GroupEntry>> {
        self.store.get_groups(device_id).await
    }

    pub async fn group_count(&self) -> Result<usize> {
        self.store.group_count().await
    }

    pub async fn apply_batch(&self, batch: BatchOperation<GroupDescription>) -> Result<GroupBatchFuture> {
        batch::submit(&self.adapters, Arc::clone(&self.store), batch, self.batch_timeout).await
    }

    /// Reconciles the store against a full report of a device's group table.
    pub async fn push_group_metrics(&self, device_id: &DeviceId, reported: Vec<GroupEntry>) -> Result<()> {
        let adapter = self.adapters.get(device_id)?;
        let span = device_span!("push_group_metrics", device_id);
        async move {
            let mut missing: HashMap<GroupStoreKey, GroupEntry> = self
                .store
                .get_groups(device_id)
                .await?
                .into_iter()
                .map(|entry| (entry.key(), entry))
                .collect();
            debug!(reported = reported.len(), stored = missing.len(), "Reconciling group table");

            for entry in &reported {
                if entry.device_id() != device_id {
                    warn!(reported_device = %entry.device_id(), "Ignoring group reported for another device");
                    continue;
                }
                match missing.remove(&entry.key()) {
                    Some(stored) => {
                        if let Err(e) = self.group_added(adapter.as_ref(), entry, stored).await {
                            warn!(group = %entry.description.key, error = %e, "Failed to reconcile reported group");
                        }
                    }
                    None => {
                        debug!(group = %entry.description.key, "Removing extraneous group");
                        adapter.remove_entries(device_id, slice::from_ref(&entry.description));
                    }
                }
            }

            for (key, stored) in missing {
                if let Err(e) = self.group_missing(adapter.as_ref(), stored).await {
                    warn!(group = %key.1, error = %e, "Failed to reconcile missing group");
                }
            }
            Ok::<_, SyncError>(())
        }
        .instrument(span)
        .await
    }

    /// Handles a device reporting that an operation on a group failed.
    pub async fn group_operation_failed(&self, device_id: &DeviceId, operation: &GroupOperation) -> Result<()> {
        let key = (device_id.clone(), operation.description.key.clone());
        warn!(device_id = %device_id, group = %key.1, kind = ?operation.kind, "Group operation failed on device");
        let event = match operation.kind {
            GroupOperationKind::Add => self.store.fail_add(&key).await?,
            GroupOperationKind::Modify => self.store.fail_update(&key).await?,
            GroupOperationKind::Delete => self.store.fail_delete(&key).await?,
        };
        if let Some(event) = event {
            self.dispatcher.post(event);
        }
        Ok(())
    }

    async fn group_added(
        &self,
        adapter: &dyn DeviceAdapter<GroupDescription>,
        reported: &GroupEntry,
        stored: GroupEntry,
    ) -> Result<()> {
        if stored.state == GroupState::PendingDelete {
            debug!(group = %stored.description.key, "Group pending deletion still installed, removing again");
            adapter.remove_entries(stored.device_id(), slice::from_ref(&stored.description));
            return Ok(());
        }
        if let Some(event) = self.store.add_or_update_group_entry(reported).await? {
            self.dispatcher.post(event);
        }
        Ok(())
    }

    async fn group_missing(&self, adapter: &dyn DeviceAdapter<GroupDescription>, stored: GroupEntry) -> Result<()> {
        if stored.state == GroupState::PendingDelete {
            debug!(group = %stored.description.key, "Group gone from device, finalising removal");
            if let Some(event) = self.store.remove_group_entry(&stored.key()).await? {
                self.dispatcher.post(event);
            }
            adapter.remove_entries(stored.device_id(), slice::from_ref(&stored.description));
        } else {
            debug!(group = %stored.description.key, state = ?stored.state, "Group missing from device, re-adding");
            adapter.apply_entries(stored.device_id(), slice::from_ref(&stored.description));
        }
        Ok(())
    }

    async fn remove_one(&self, adapter: &dyn DeviceAdapter<GroupDescription>, description: &GroupDescription) -> Result<()> {
        let event = self.store.delete_group_description(description).await?;
        if self.mastership.is_local_master(&description.device_id) {
            debug!(device_id = %description.device_id, group = %description.key, "Removing group");
            adapter.remove_entries(&description.device_id, slice::from_ref(description));
        }
        if let Some(event) = event {
            self.dispatcher.post(event);
        }
        Ok(())
    }

    fn resolve(&self, descriptions: &[GroupDescription]) -> Result<Vec<Arc<dyn DeviceAdapter<GroupDescription>>>> {
        descriptions
            .iter()
            .map(|description| self.adapters.get(&description.device_id))
            .collect()
    }
}

struct GroupStoreDelegate {
    adapters: Arc<AdapterRegistry<GroupDescription>>,
    dispatcher: Arc<EventDispatcher<GroupEvent>>,
}

impl StoreDelegate<GroupEvent> for GroupStoreDelegate {
    fn notify(&self, event: GroupEvent) {
        let entry = event.subject();
        match self.adapters.get(entry.device_id()) {
            Ok(adapter) => match &event {
                GroupEvent::GroupAddRequested(entry) | GroupEvent::GroupUpdateRequested(entry) => {
                    adapter.apply_entries(entry.device_id(), slice::from_ref(&entry.description));
                }
                GroupEvent::GroupRemoveRequested(entry) => {
                    adapter.remove_entries(entry.device_id(), slice::from_ref(&entry.description));
                }
                _ => {}
            },
            Err(e) => warn!(error = %e, "Cannot act on remote group request"),
        }
        self.dispatcher.post(event);
    }
}
