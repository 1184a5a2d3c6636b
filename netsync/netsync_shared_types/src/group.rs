//! Groups: bucket lists installed on a device and referenced by flow rules.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::flow::TrafficTreatment;
use crate::{ApplicationId, DeviceId, ManagedEntity, SyncEvent};

/// Application-chosen identity of a group on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    All,
    Select,
    Indirect,
    Failover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBucket {
    pub treatment: TrafficTreatment,
    pub weight: u16,
}

impl GroupBucket {
    pub fn new(treatment: TrafficTreatment) -> Self {
        Self {
            treatment,
            weight: 1,
        }
    }
}

/// What an application asks to have installed on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub device_id: DeviceId,
    pub key: GroupKey,
    pub app_id: ApplicationId,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
}

impl ManagedEntity for GroupDescription {
    type Key = (DeviceId, GroupKey);

    fn key(&self) -> Self::Key {
        (self.device_id.clone(), self.key.clone())
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn app_id(&self) -> &ApplicationId {
        &self.app_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupState {
    PendingAdd,
    Added,
    PendingUpdate,
    PendingDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub description: GroupDescription,
    pub state: GroupState,
    pub packets: u64,
    pub bytes: u64,
    pub life_secs: u64,
}

impl GroupEntry {
    pub fn pending(description: GroupDescription) -> Self {
        Self {
            description,
            state: GroupState::PendingAdd,
            packets: 0,
            bytes: 0,
            life_secs: 0,
        }
    }

    pub fn reported(description: GroupDescription, packets: u64, bytes: u64) -> Self {
        Self {
            description,
            state: GroupState::Added,
            packets,
            bytes,
            life_secs: 0,
        }
    }

    pub fn key(&self) -> (DeviceId, GroupKey) {
        self.description.key()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.description.device_id
    }

    pub fn with_state(&self, state: GroupState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub fn with_counters_from(&self, reported: &GroupEntry) -> Self {
        Self {
            packets: reported.packets,
            bytes: reported.bytes,
            life_secs: reported.life_secs,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperationKind {
    Add,
    Modify,
    Delete,
}

/// A single operation a device reports back on, e.g. when it fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOperation {
    pub kind: GroupOperationKind,
    pub description: GroupDescription,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    GroupAddRequested(GroupEntry),
    GroupUpdateRequested(GroupEntry),
    GroupRemoveRequested(GroupEntry),
    GroupAdded(GroupEntry),
    GroupUpdated(GroupEntry),
    GroupRemoved(GroupEntry),
    GroupAddFailed(GroupEntry),
    GroupUpdateFailed(GroupEntry),
    GroupRemoveFailed(GroupEntry),
}

impl GroupEvent {
    pub fn subject(&self) -> &GroupEntry {
        match self {
            GroupEvent::GroupAddRequested(entry)
            | GroupEvent::GroupUpdateRequested(entry)
            | GroupEvent::GroupRemoveRequested(entry)
            | GroupEvent::GroupAdded(entry)
            | GroupEvent::GroupUpdated(entry)
            | GroupEvent::GroupRemoved(entry)
            | GroupEvent::GroupAddFailed(entry)
            | GroupEvent::GroupUpdateFailed(entry)
            | GroupEvent::GroupRemoveFailed(entry) => entry,
        }
    }
}

impl SyncEvent for GroupEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GroupEvent::GroupAddRequested(_) => "GROUP_ADD_REQUESTED",
            GroupEvent::GroupUpdateRequested(_) => "GROUP_UPDATE_REQUESTED",
            GroupEvent::GroupRemoveRequested(_) => "GROUP_REMOVE_REQUESTED",
            GroupEvent::GroupAdded(_) => "GROUP_ADDED",
            GroupEvent::GroupUpdated(_) => "GROUP_UPDATED",
            GroupEvent::GroupRemoved(_) => "GROUP_REMOVED",
            GroupEvent::GroupAddFailed(_) => "GROUP_ADD_FAILED",
            GroupEvent::GroupUpdateFailed(_) => "GROUP_UPDATE_FAILED",
            GroupEvent::GroupRemoveFailed(_) => "GROUP_REMOVE_FAILED",
        }
    }
}
