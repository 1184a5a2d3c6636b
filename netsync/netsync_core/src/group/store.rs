//! Replicated group store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use netsync_shared_types::{
    ApplicationId, DeviceId, GroupDescription, GroupEntry, GroupEvent, GroupKey, GroupState,
    NodeId, Result, SyncError,
};
use state_store_interface::{
    ConsistentMap, MapEvent, MapEventKind, MapEventListener, StoreDelegate, Versioned,
};

use crate::batch::BatchStore;
use crate::mastership::MastershipService;

pub const GROUP_TABLE_MAP: &str = "netsync-group-table";

pub type GroupStoreKey = (DeviceId, GroupKey);

pub struct GroupStore {
    entries: Arc<dyn ConsistentMap<GroupStoreKey, GroupEntry>>,
    mastership: Arc<dyn MastershipService>,
}

impl GroupStore {
    pub fn new(
        entries: Arc<dyn ConsistentMap<GroupStoreKey, GroupEntry>>,
        mastership: Arc<dyn MastershipService>,
    ) -> Self {
        Self {
            entries,
            mastership,
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn StoreDelegate<GroupEvent>>) {
        self.entries.add_listener(Arc::new(RemoteGroupListener {
            local_node: self.entries.local_node().clone(),
            mastership: Arc::clone(&self.mastership),
            delegate,
        }));
    }

    /// Records a group as intended. Repeating the call changes nothing.
    pub async fn store_group_description(&self, description: &GroupDescription) -> Result<Option<GroupEvent>> {
        let key = key_of(description);
        let pending = GroupEntry::pending(description.clone());
        let entry = match self.entries.put_if_absent(key.clone(), pending.clone()).await? {
            None => pending,
            Some(existing)
                if existing.value.state != GroupState::PendingDelete
                    && existing.value.description == *description =>
            {
                existing.value
            }
            Some(_) => {
                self.entries.put(key, pending.clone()).await?;
                pending
            }
        };
        Ok(self.local_event(&description.device_id, GroupEvent::GroupAddRequested(entry)))
    }

    /// Replaces the buckets (and type) of an existing group.
    pub async fn update_group_description(&self, description: &GroupDescription) -> Result<Option<GroupEvent>> {
        let key = key_of(description);
        loop {
            let current = self.entries.get(&key).await?.ok_or_else(|| {
                SyncError::InvalidArgument(format!(
                    "group {} does not exist on {}",
                    description.key, description.device_id
                ))
            })?;
            let updated = GroupEntry {
                description: description.clone(),
                ..current.value.with_state(GroupState::PendingUpdate)
            };
            if self
                .entries
                .replace_version(&key, current.version, updated.clone())
                .await?
            {
                return Ok(self.local_event(
                    &description.device_id,
                    GroupEvent::GroupUpdateRequested(updated),
                ));
            }
            trace!(key = ?key, "Concurrent group update, retrying");
        }
    }

    /// Marks a group as pending deletion.
    pub async fn delete_group_description(&self, description: &GroupDescription) -> Result<Option<GroupEvent>> {
        let Some(marked) = self
            .transition(&key_of(description), |entry| {
                Some(entry.with_state(GroupState::PendingDelete))
            })
            .await?
        else {
            return Ok(None);
        };
        Ok(self.local_event(&description.device_id, GroupEvent::GroupRemoveRequested(marked)))
    }

    /// Merges a reported group into the store.
    ///
    /// Confirms pending adds (`GroupAdded`) and pending updates
    /// (`GroupUpdated`); a settled group only has its counters refreshed.
    pub async fn add_or_update_group_entry(&self, reported: &GroupEntry) -> Result<Option<GroupEvent>> {
        let mut previous_state = None;
        let updated = self
            .transition(&reported.key(), |entry| {
                previous_state = Some(entry.state);
                let refreshed = entry.with_counters_from(reported);
                Some(match entry.state {
                    GroupState::PendingAdd | GroupState::PendingUpdate => {
                        refreshed.with_state(GroupState::Added)
                    }
                    _ => refreshed,
                })
            })
            .await?;
        Ok(updated.map(|entry| match previous_state {
            Some(GroupState::PendingAdd) => GroupEvent::GroupAdded(entry),
            _ => GroupEvent::GroupUpdated(entry),
        }))
    }

    pub async fn remove_group_entry(&self, key: &GroupStoreKey) -> Result<Option<GroupEvent>> {
        Ok(self
            .entries
            .remove(key)
            .await?
            .map(|removed| GroupEvent::GroupRemoved(removed.into_value())))
    }

    /// The device could not install the group: drop it.
    pub async fn fail_add(&self, key: &GroupStoreKey) -> Result<Option<GroupEvent>> {
        Ok(self
            .entries
            .remove(key)
            .await?
            .map(|removed| GroupEvent::GroupAddFailed(removed.into_value())))
    }

    /// The device rejected an update; the group stays installed.
    pub async fn fail_update(&self, key: &GroupStoreKey) -> Result<Option<GroupEvent>> {
        Ok(self
            .transition(key, |entry| Some(entry.with_state(GroupState::Added)))
            .await?
            .map(GroupEvent::GroupUpdateFailed))
    }

    /// The device still has the group.
    pub async fn fail_delete(&self, key: &GroupStoreKey) -> Result<Option<GroupEvent>> {
        Ok(self
            .transition(key, |entry| Some(entry.with_state(GroupState::Added)))
            .await?
            .map(GroupEvent::GroupRemoveFailed))
    }

    pub async fn get_group(&self, key: &GroupStoreKey) -> Result<Option<GroupEntry>> {
        Ok(self.entries.get(key).await?.map(Versioned::into_value))
    }

    pub async fn get_groups(&self, device_id: &DeviceId) -> Result<Vec<GroupEntry>> {
        Ok(self
            .entries
            .entries()
            .await?
            .into_iter()
            .filter(|((device, _), _)| device == device_id)
            .map(|(_, entry)| entry.into_value())
            .collect())
    }

    pub async fn get_groups_by_app(&self, app_id: &ApplicationId) -> Result<Vec<GroupEntry>> {
        Ok(self
            .entries
            .entries()
            .await?
            .into_iter()
            .filter(|(_, entry)| &entry.value.description.app_id == app_id)
            .map(|(_, entry)| entry.into_value())
            .collect())
    }

    pub async fn group_count(&self) -> Result<usize> {
        self.entries.size().await
    }

    /// Compare-and-swap loop over one entry. `change` returning `None`
    /// leaves the entry alone.
    async fn transition<F>(&self, key: &GroupStoreKey, mut change: F) -> Result<Option<GroupEntry>>
    where
        F: FnMut(&GroupEntry) -> Option<GroupEntry> + Send,
    {
        loop {
            let Some(current) = self.entries.get(key).await? else {
                return Ok(None);
            };
            let Some(updated) = change(&current.value) else {
                return Ok(None);
            };
            if self
                .entries
                .replace_version(key, current.version, updated.clone())
                .await?
            {
                return Ok(Some(updated));
            }
            trace!(key = ?key, "Concurrent group update, retrying");
        }
    }

    fn local_event(&self, device_id: &DeviceId, event: GroupEvent) -> Option<GroupEvent> {
        if self.mastership.is_local_master(device_id) {
            Some(event)
        } else {
            debug!(device_id = %device_id, "Device mastered elsewhere, not pushing locally");
            None
        }
    }
}

fn key_of(description: &GroupDescription) -> GroupStoreKey {
    (description.device_id.clone(), description.key.clone())
}

#[async_trait]
impl BatchStore<GroupDescription> for GroupStore {
    type Stored = GroupEntry;

    async fn provision_add(&self, target: &GroupDescription) -> Result<Option<GroupEntry>> {
        Ok(self
            .entries
            .put(key_of(target), GroupEntry::pending(target.clone()))
            .await?
            .map(Versioned::into_value))
    }

    async fn provision_remove(&self, target: &GroupDescription) -> Result<Option<GroupEntry>> {
        let key = key_of(target);
        let Some(current) = self.entries.get(&key).await? else {
            return Ok(None);
        };
        self.entries
            .put(key, current.value.with_state(GroupState::PendingDelete))
            .await?;
        Ok(Some(current.value))
    }

    async fn revoke(&self, target: &GroupDescription) -> Result<()> {
        self.entries.remove(&key_of(target)).await?;
        Ok(())
    }

    async fn restore(&self, stored: GroupEntry) -> Result<()> {
        self.entries.put(stored.key(), stored).await?;
        Ok(())
    }
}

struct RemoteGroupListener {
    local_node: NodeId,
    mastership: Arc<dyn MastershipService>,
    delegate: Arc<dyn StoreDelegate<GroupEvent>>,
}

impl MapEventListener<GroupStoreKey, GroupEntry> for RemoteGroupListener {
    fn event(&self, event: &MapEvent<GroupStoreKey, GroupEntry>) {
        if !event.is_remote(&self.local_node) || !self.mastership.is_local_master(&event.key.0) {
            return;
        }
        if event.kind == MapEventKind::Remove {
            return;
        }
        let Some(new) = &event.new_value else {
            return;
        };
        if event.old_value.as_ref().map(|old| old.value.state) == Some(new.value.state) {
            return;
        }
        let request = match new.value.state {
            GroupState::PendingAdd => GroupEvent::GroupAddRequested(new.value.clone()),
            GroupState::PendingUpdate => GroupEvent::GroupUpdateRequested(new.value.clone()),
            GroupState::PendingDelete => GroupEvent::GroupRemoveRequested(new.value.clone()),
            GroupState::Added => return,
        };
        debug!(origin = %event.origin, group = %event.key.1, "Remote group write for a local device");
        self.delegate.notify(request);
    }
}
