//! Flow rule subsystem: replicated store, liveness tracking and the
//! reconciling manager.

pub mod liveness;
pub mod manager;
pub mod store;

pub use liveness::LivenessTracker;
pub use manager::{FlowRuleBatchFuture, FlowRuleManager};
pub use store::{FlowRuleStore, FLOW_TABLE_MAP};
