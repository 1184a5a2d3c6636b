use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

pub mod batch;
pub mod flow;
pub mod group;
pub mod intent;

pub use batch::{BatchDirective, BatchEntry, BatchOperation, BatchState, CompletedBatchOperation};
pub use flow::{
    FlowEntry, FlowEntryState, FlowId, FlowKey, FlowRule, FlowRuleEvent, TrafficSelector,
    TrafficTreatment,
};
pub use group::{
    GroupBucket, GroupDescription, GroupEntry, GroupEvent, GroupKey, GroupOperation,
    GroupOperationKind, GroupState, GroupType,
};
pub use intent::{ConnectPoint, Intent, IntentEvent, IntentId, IntentKind, IntentState};

/// Identifier of a network device (switch, router) under control.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a controller process (cluster member).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Owner tag attached to flow rules, groups and intents (e.g. "org.netsync.fwd").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId(String);

impl ApplicationId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApplicationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// An element the controller keeps in sync with a device: a flow rule or a group.
///
/// Equality of `Key` is the identity used for store lookups and for diffing
/// reported batches against stored state.
pub trait ManagedEntity: Clone + fmt::Debug + Send + Sync + 'static {
    type Key: Clone + fmt::Debug + Eq + Hash + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    fn device_id(&self) -> &DeviceId;

    fn app_id(&self) -> &ApplicationId;
}

/// An event published through an event dispatcher.
pub trait SyncEvent: Clone + fmt::Debug + Send + Sync + 'static {
    /// Short, stable name of the event type, used for per-type counters.
    fn event_type(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No device adapter registered for device {0}")]
    AdapterNotFound(DeviceId),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Illegal intent state transition for {intent}: {from:?} -> {to:?}")]
    IllegalTransition {
        intent: IntentId,
        from: Option<IntentState>,
        to: IntentState,
    },
    #[error("Intent not found: {0}")]
    IntentNotFound(IntentId),
    #[error("Batch operation cancelled")]
    Cancelled,
    #[error("Batch operation timed out")]
    Timeout,
    #[error("State store error: {0}")]
    StoreError(String),
    #[error("Device adapter error: {0}")]
    AdapterError(String),
    #[error("Intent compilation error: {0}")]
    CompilationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

// Generic result type for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;
