use dashmap::DashMap;
use futures_util::future::BoxFuture;
use netsync_shared_types::{
    BatchOperation, CompletedBatchOperation, DeviceId, FlowRule, GroupDescription, ManagedEntity,
    Result, SyncError,
};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identifier of the southbound provider behind an adapter (e.g. "of", "p4runtime").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Future resolving to the outcome of one device-level batch.
pub type PartitionFuture<T> = BoxFuture<'static, Result<CompletedBatchOperation<T>>>;

/// Trait for pushing entries of one element class down to devices.
///
/// `apply_entries` and `remove_entries` are fire-and-forget: the device
/// confirms (or contradicts) them later through reported batches. All calls
/// must be idempotent, since reconciliation re-issues them freely.
pub trait DeviceAdapter<T: ManagedEntity>: Send + Sync {
    fn provider_id(&self) -> &ProviderId;

    /// Installs (or re-installs) entries on a device.
    fn apply_entries(&self, device_id: &DeviceId, entries: &[T]);

    /// Removes entries from a device.
    fn remove_entries(&self, device_id: &DeviceId, entries: &[T]);

    /// Executes a batch on a single device and reports which items failed.
    fn execute_batch(&self, device_id: &DeviceId, batch: BatchOperation<T>) -> PartitionFuture<T>;
}

pub type FlowRuleProvider = dyn DeviceAdapter<FlowRule>;
pub type GroupProvider = dyn DeviceAdapter<GroupDescription>;

/// Errors specific to device adapters
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Device {0} is not reachable")]
    DeviceUnreachable(DeviceId),
    #[error("Device {device} rejected the batch: {reason}")]
    BatchRejected { device: DeviceId, reason: String },
    #[error("Adapter communication error: {0}")]
    CommunicationError(String),
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        SyncError::AdapterError(err.to_string())
    }
}

/// Maps devices to the adapter responsible for them.
pub struct AdapterRegistry<T: ManagedEntity> {
    adapters: DashMap<DeviceId, Arc<dyn DeviceAdapter<T>>>,
}

impl<T: ManagedEntity> Default for AdapterRegistry<T> {
    fn default() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }
}

impl<T: ManagedEntity> AdapterRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: DeviceId, adapter: Arc<dyn DeviceAdapter<T>>) {
        debug!(device_id = %device_id, provider = %adapter.provider_id(), "Registering device adapter");
        self.adapters.insert(device_id, adapter);
    }

    pub fn unregister(&self, device_id: &DeviceId) -> Option<Arc<dyn DeviceAdapter<T>>> {
        self.adapters.remove(device_id).map(|(_, adapter)| adapter)
    }

    /// Looks up the adapter for a device.
    ///
    /// Callers validate device existence upstream, so a miss is a
    /// precondition violation and is reported as `AdapterNotFound`.
    pub fn get(&self, device_id: &DeviceId) -> Result<Arc<dyn DeviceAdapter<T>>> {
        self.adapters
            .get(device_id)
            .map(|adapter| Arc::clone(adapter.value()))
            .ok_or_else(|| SyncError::AdapterNotFound(device_id.clone()))
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.adapters.iter().map(|entry| entry.key().clone()).collect()
    }
}
