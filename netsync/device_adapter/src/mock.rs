//! Mock device adapter for testing and development.
//!
//! Simulates device tables in memory and records every call it receives so
//! tests can assert on what the controller pushed down.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use tracing::{debug, info};

use device_adapter_interface::{AdapterError, DeviceAdapter, PartitionFuture, ProviderId};
use netsync_shared_types::{
    BatchDirective, BatchOperation, CompletedBatchOperation, DeviceId, ManagedEntity, SyncError,
};

/// How the mock answers `execute_batch` for a device.
#[derive(Debug, Clone, Default)]
pub enum BatchBehavior {
    /// Apply every directive and report success.
    #[default]
    Succeed,
    /// Report the first `n` items as failed without applying them.
    FailItems(usize),
    /// Resolve the batch future with an adapter error.
    Error(String),
    /// Wait before applying and reporting success.
    Delay(Duration),
    /// Never resolve.
    Hang,
}

/// A single recorded adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall<T> {
    Apply(DeviceId, T),
    Remove(DeviceId, T),
    Batch(DeviceId, BatchOperation<T>),
}

pub struct MockDeviceAdapter<T: ManagedEntity> {
    provider_id: ProviderId,
    /// Simulated device tables
    tables: DashMap<DeviceId, HashMap<T::Key, T>>,
    /// Every call, in arrival order
    calls: Mutex<Vec<AdapterCall<T>>>,
    behaviors: DashMap<DeviceId, BatchBehavior>,
}

impl<T: ManagedEntity> MockDeviceAdapter<T> {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: ProviderId::new(provider_id),
            tables: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            behaviors: DashMap::new(),
        }
    }

    /// Sets how batches for `device_id` are answered.
    pub fn set_batch_behavior(&self, device_id: DeviceId, behavior: BatchBehavior) {
        self.behaviors.insert(device_id, behavior);
    }

    /// Entries currently installed in the simulated table of a device.
    pub fn installed(&self, device_id: &DeviceId) -> Vec<T> {
        self.tables
            .get(device_id)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Puts an entry in a device table without going through the controller,
    /// as if someone configured the device directly.
    pub fn install_out_of_band(&self, entry: T) {
        self.tables
            .entry(entry.device_id().clone())
            .or_default()
            .insert(entry.key(), entry);
    }

    /// Drops an entry from a device table, as if the device lost it.
    pub fn lose(&self, entry: &T) {
        if let Some(mut table) = self.tables.get_mut(entry.device_id()) {
            table.remove(&entry.key());
        }
    }

    pub fn calls(&self) -> Vec<AdapterCall<T>> {
        self.lock_calls().clone()
    }

    pub fn applied(&self) -> Vec<T> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                AdapterCall::Apply(_, entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<T> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                AdapterCall::Remove(_, entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn batches(&self) -> Vec<(DeviceId, BatchOperation<T>)> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                AdapterCall::Batch(device, batch) => Some((device.clone(), batch.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock_calls().clear();
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<AdapterCall<T>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_directives(
        tables: &DashMap<DeviceId, HashMap<T::Key, T>>,
        device_id: &DeviceId,
        batch: &BatchOperation<T>,
    ) {
        let mut table = tables.entry(device_id.clone()).or_default();
        for entry in batch.entries() {
            match entry.directive {
                BatchDirective::Add | BatchDirective::Modify => {
                    table.insert(entry.target.key(), entry.target.clone());
                }
                BatchDirective::Remove => {
                    table.remove(&entry.target.key());
                }
            }
        }
    }
}

impl<T: ManagedEntity> DeviceAdapter<T> for MockDeviceAdapter<T> {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    fn apply_entries(&self, device_id: &DeviceId, entries: &[T]) {
        let mut calls = self.lock_calls();
        let mut table = self.tables.entry(device_id.clone()).or_default();
        for entry in entries {
            debug!(device_id = %device_id, "MockDeviceAdapter: applying {:?}", entry.key());
            calls.push(AdapterCall::Apply(device_id.clone(), entry.clone()));
            table.insert(entry.key(), entry.clone());
        }
    }

    fn remove_entries(&self, device_id: &DeviceId, entries: &[T]) {
        let mut calls = self.lock_calls();
        let mut table = self.tables.entry(device_id.clone()).or_default();
        for entry in entries {
            debug!(device_id = %device_id, "MockDeviceAdapter: removing {:?}", entry.key());
            calls.push(AdapterCall::Remove(device_id.clone(), entry.clone()));
            table.remove(&entry.key());
        }
    }

    fn execute_batch(&self, device_id: &DeviceId, batch: BatchOperation<T>) -> PartitionFuture<T> {
        info!(
            device_id = %device_id,
            "MockDeviceAdapter: executing batch of {} operations",
            batch.len()
        );
        self.lock_calls()
            .push(AdapterCall::Batch(device_id.clone(), batch.clone()));

        let behavior = self
            .behaviors
            .get(device_id)
            .map(|b| b.value().clone())
            .unwrap_or_default();

        match behavior {
            BatchBehavior::Succeed => {
                Self::apply_directives(&self.tables, device_id, &batch);
                futures_util::future::ready(Ok(CompletedBatchOperation::succeeded())).boxed()
            }
            BatchBehavior::FailItems(n) => {
                let entries = batch.into_entries();
                let failed: Vec<T> = entries.iter().take(n).map(|e| e.target.clone()).collect();
                let applied = BatchOperation::from_entries(entries.into_iter().skip(n).collect());
                Self::apply_directives(&self.tables, device_id, &applied);
                futures_util::future::ready(Ok(CompletedBatchOperation::failed(failed))).boxed()
            }
            BatchBehavior::Error(reason) => {
                let err = AdapterError::BatchRejected {
                    device: device_id.clone(),
                    reason,
                };
                futures_util::future::ready(Err(err.into())).boxed()
            }
            BatchBehavior::Delay(delay) => {
                // Applied up front; only the acknowledgement is late.
                Self::apply_directives(&self.tables, device_id, &batch);
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, SyncError>(CompletedBatchOperation::succeeded())
                }
                .boxed()
            }
            BatchBehavior::Hang => futures_util::future::pending().boxed(),
        }
    }
}
