//! Batch Operation Coordinator
//!
//! A batch is split into one partition per device. Store mutations for ADD
//! and REMOVE directives are applied optimistically when the batch is
//! submitted, before any device has answered; each partition is then handed
//! to its device adapter as an independent task.
//!
//! # Lifecycle
//!
//! ```text
//! Started ──(all partitions succeed)──────────────► Finished (success)
//!    │    ──(first failed partition: compensate)──► Finished (failure)
//!    └────(cancel: compensate, abort partitions)──► Cancelled
//! ```
//!
//! Terminal states are reached through a single compare-and-swap on the
//! state cell, so compensation runs at most once no matter how `get` and
//! `cancel` race. Once finished, the result is cached and every later `get`
//! returns it.
//!
//! Compensation runs on its own task. A caller that stops waiting, for
//! example on a `get_timeout` deadline, does not interrupt the rollback.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use device_adapter_interface::AdapterRegistry;
use netsync_shared_types::{
    BatchDirective, BatchOperation, BatchState, CompletedBatchOperation, DeviceId, ManagedEntity,
    Result, SyncError,
};

/// Store-side bookkeeping the coordinator performs around a batch.
#[async_trait]
pub trait BatchStore<T: ManagedEntity>: Send + Sync + 'static {
    /// What the store holds for a target; used to put things back.
    type Stored: Clone + Send + Sync + 'static;

    /// Records `target` as intended. Returns whatever it replaced.
    async fn provision_add(&self, target: &T) -> Result<Option<Self::Stored>>;

    /// Marks `target` for removal. Returns the entry as it was before.
    async fn provision_remove(&self, target: &T) -> Result<Option<Self::Stored>>;

    /// Deletes the provisional entry written for `target`.
    async fn revoke(&self, target: &T) -> Result<()>;

    /// Writes back an entry captured before the batch touched it.
    async fn restore(&self, stored: Self::Stored) -> Result<()>;
}

enum Compensation<T, E> {
    Revoke(T),
    Restore(E),
}

struct Partition<T> {
    device_id: DeviceId,
    items: Vec<T>,
    handle: JoinHandle<Result<CompletedBatchOperation<T>>>,
}

struct Progress<T> {
    partitions: Vec<Partition<T>>,
    /// Index of the first partition whose outcome has not been collected.
    next: usize,
    result: Option<CompletedBatchOperation<T>>,
    /// Rollback started by a failed `get`, until someone has seen it finish.
    compensating: Option<JoinHandle<()>>,
}

impl<T> Progress<T> {
    async fn wait_compensated(&mut self) {
        if let Some(handle) = self.compensating.as_mut() {
            if let Err(e) = handle.await {
                error!(error = %e, "Batch compensation task died");
            }
            self.compensating = None;
        }
    }
}

/// Handle on a submitted batch.
pub struct BatchFuture<T: ManagedEntity, S: BatchStore<T>> {
    state: AtomicU8,
    store: Arc<S>,
    compensations: Mutex<Option<Vec<Compensation<T, S::Stored>>>>,
    abort_handles: Vec<AbortHandle>,
    progress: tokio::sync::Mutex<Progress<T>>,
    default_timeout: Duration,
}

/// Partitions `batch` by device, applies the optimistic store mutations and
/// dispatches one adapter batch per partition.
///
/// Every device must have an adapter; a missing one is reported as
/// `AdapterNotFound` before the store is touched.
pub async fn submit<T, S>(
    registry: &AdapterRegistry<T>,
    store: Arc<S>,
    batch: BatchOperation<T>,
    default_timeout: Duration,
) -> Result<BatchFuture<T, S>>
where
    T: ManagedEntity,
    S: BatchStore<T>,
{
    let partitions = batch.partition_by(|target| target.device_id().clone());

    let mut routed = Vec::with_capacity(partitions.len());
    for (device_id, partition) in partitions {
        let adapter = registry.get(&device_id)?;
        routed.push((device_id, adapter, partition));
    }

    let mut compensations = Vec::new();
    for (device_id, _, partition) in &routed {
        for entry in partition.entries() {
            let step = match entry.directive {
                BatchDirective::Add => store
                    .provision_add(&entry.target)
                    .await
                    .map(|previous| match previous {
                        Some(previous) => Some(Compensation::Restore(previous)),
                        None => Some(Compensation::Revoke(entry.target.clone())),
                    }),
                BatchDirective::Remove => store
                    .provision_remove(&entry.target)
                    .await
                    .map(|previous| previous.map(Compensation::Restore)),
                BatchDirective::Modify => {
                    error!(
                        device_id = %device_id,
                        key = ?entry.target.key(),
                        "MODIFY directives are not supported; forwarding without store bookkeeping"
                    );
                    Ok(None)
                }
            };
            match step {
                Ok(Some(compensation)) => compensations.push(compensation),
                Ok(None) => {}
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Store write failed while submitting batch, undoing");
                    undo(store.as_ref(), compensations).await;
                    return Err(e);
                }
            }
        }
    }

    let mut dispatched = Vec::with_capacity(routed.len());
    let mut abort_handles = Vec::with_capacity(routed.len());
    for (device_id, adapter, partition) in routed {
        debug!(device_id = %device_id, operations = partition.len(), "Dispatching batch partition");
        let items = partition.entries().iter().map(|e| e.target.clone()).collect();
        let handle = tokio::spawn(adapter.execute_batch(&device_id, partition));
        abort_handles.push(handle.abort_handle());
        dispatched.push(Partition {
            device_id,
            items,
            handle,
        });
    }

    Ok(BatchFuture {
        state: AtomicU8::new(BatchState::Started as u8),
        store,
        compensations: Mutex::new(Some(compensations)),
        abort_handles,
        progress: tokio::sync::Mutex::new(Progress {
            partitions: dispatched,
            next: 0,
            result: None,
            compensating: None,
        }),
        default_timeout,
    })
}

impl<T: ManagedEntity, S: BatchStore<T>> BatchFuture<T, S> {
    pub fn state(&self) -> BatchState {
        BatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == BatchState::Cancelled
    }

    pub fn partition_count(&self) -> usize {
        self.abort_handles.len()
    }

    /// Waits for every partition, or for the first failure.
    ///
    /// Partial failure is a normal result with `success == false`, not an
    /// error. Returns `Cancelled` if the batch was cancelled.
    pub async fn get(&self) -> Result<CompletedBatchOperation<T>> {
        let mut progress = self.progress.lock().await;
        if let Some(result) = progress.result.clone() {
            progress.wait_compensated().await;
            return Ok(result);
        }

        while progress.next < progress.partitions.len() {
            if self.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let index = progress.next;
            let partition = &mut progress.partitions[index];
            let outcome = (&mut partition.handle).await;
            let device_id = partition.device_id.clone();

            let failed_items = match outcome {
                Ok(Ok(completed)) if completed.success => None,
                Ok(Ok(completed)) => Some(completed.failed_items),
                Ok(Err(e)) => {
                    warn!(device_id = %device_id, error = %e, "Batch partition failed");
                    Some(partition.items.clone())
                }
                Err(_) if self.is_cancelled() => return Err(SyncError::Cancelled),
                Err(join_error) => {
                    error!(device_id = %device_id, error = %join_error, "Batch partition task died");
                    Some(partition.items.clone())
                }
            };

            match failed_items {
                None => progress.next += 1,
                Some(failed_items) => {
                    if !self.transition(BatchState::Finished) {
                        return Err(SyncError::Cancelled);
                    }
                    info!(
                        device_id = %device_id,
                        failed = failed_items.len(),
                        "Batch failed, compensating store mutations"
                    );
                    self.abort_partitions();
                    let result = CompletedBatchOperation::failed(failed_items);
                    progress.next = progress.partitions.len();
                    progress.result = Some(result.clone());
                    progress.compensating = self.spawn_compensation();
                    progress.wait_compensated().await;
                    return Ok(result);
                }
            }
        }

        if !self.transition(BatchState::Finished) {
            return Err(SyncError::Cancelled);
        }
        debug!(partitions = progress.partitions.len(), "Batch finished");
        let result = CompletedBatchOperation::succeeded();
        progress.result = Some(result.clone());
        Ok(result)
    }

    /// Like [`get`](Self::get), giving up after `timeout`.
    ///
    /// A timeout leaves the batch running; outcomes collected so far are
    /// kept for the next call. If the deadline hits while a failed batch is
    /// being rolled back, the rollback continues and the next `get` returns
    /// the failure once it is done.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<CompletedBatchOperation<T>> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// [`get_timeout`](Self::get_timeout) with the configured batch deadline.
    pub async fn get_default(&self) -> Result<CompletedBatchOperation<T>> {
        self.get_timeout(self.default_timeout).await
    }

    /// Cancels a running batch: undoes the optimistic store mutations and
    /// aborts outstanding partitions. Returns false if the batch had already
    /// finished or been cancelled.
    pub async fn cancel(&self) -> bool {
        if !self.transition(BatchState::Cancelled) {
            return false;
        }
        info!(partitions = self.abort_handles.len(), "Cancelling batch");
        self.abort_partitions();
        if let Some(handle) = self.spawn_compensation() {
            if let Err(e) = handle.await {
                error!(error = %e, "Batch compensation task died");
            }
        }
        true
    }

    fn transition(&self, to: BatchState) -> bool {
        self.state
            .compare_exchange(
                BatchState::Started as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn abort_partitions(&self) {
        for handle in &self.abort_handles {
            handle.abort();
        }
    }

    fn spawn_compensation(&self) -> Option<JoinHandle<()>> {
        let compensations = self
            .compensations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let store = Arc::clone(&self.store);
        Some(tokio::spawn(async move {
            undo(store.as_ref(), compensations).await;
        }))
    }
}

/// Applies compensations newest first, so a target touched twice ends up
/// as it was before the batch.
async fn undo<T, S>(store: &S, compensations: Vec<Compensation<T, S::Stored>>)
where
    T: ManagedEntity,
    S: BatchStore<T>,
{
    for compensation in compensations.into_iter().rev() {
        let outcome = match compensation {
            Compensation::Revoke(target) => store.revoke(&target).await,
            Compensation::Restore(stored) => store.restore(stored).await,
        };
        if let Err(e) = outcome {
            error!(error = %e, "Failed to compensate batch store mutation");
        }
    }
}
