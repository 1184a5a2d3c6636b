//! Which cluster member is responsible for talking to which device.

use dashmap::DashMap;
use tracing::debug;

use netsync_shared_types::{DeviceId, NodeId};

/// Answers whether this process is the master of a device.
///
/// Store writes for devices mastered elsewhere are still recorded, but only
/// the master pushes them down to the device.
pub trait MastershipService: Send + Sync {
    fn local_node(&self) -> &NodeId;

    fn master_for(&self, device_id: &DeviceId) -> Option<NodeId>;

    fn is_local_master(&self, device_id: &DeviceId) -> bool {
        self.master_for(device_id).as_ref() == Some(self.local_node())
    }
}

/// Mastership from an explicit device-to-node table.
///
/// Devices with no recorded master default to the local node, so a
/// single-node deployment needs no setup.
pub struct StaticMastership {
    local_node: NodeId,
    masters: DashMap<DeviceId, NodeId>,
}

impl StaticMastership {
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            masters: DashMap::new(),
        }
    }

    pub fn set_master(&self, device_id: DeviceId, node: NodeId) {
        debug!(device_id = %device_id, node = %node, "Setting device master");
        self.masters.insert(device_id, node);
    }
}

impl MastershipService for StaticMastership {
    fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    fn master_for(&self, device_id: &DeviceId) -> Option<NodeId> {
        Some(
            self.masters
                .get(device_id)
                .map(|node| node.value().clone())
                .unwrap_or_else(|| self.local_node.clone()),
        )
    }
}
