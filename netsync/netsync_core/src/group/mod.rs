//! Group subsystem: replicated store and reconciling manager.

pub mod manager;
pub mod store;

pub use manager::{GroupBatchFuture, GroupManager};
pub use store::{GroupStore, GroupStoreKey, GROUP_TABLE_MAP};
