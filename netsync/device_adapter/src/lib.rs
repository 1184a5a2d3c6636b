//! Device adapter implementations.
//!
//! - `MockDeviceAdapter`: in-memory simulated device table for testing and
//!   demos (requires `mock-adapter` feature)
//!
//! Protocol-backed adapters (OpenFlow, P4Runtime) live outside this workspace
//! and implement [`DeviceAdapter`] directly.

#[cfg(feature = "mock-adapter")]
pub mod mock;

pub use device_adapter_interface::{
    AdapterError, AdapterRegistry, DeviceAdapter, FlowRuleProvider, GroupProvider,
    PartitionFuture, ProviderId,
};

#[cfg(feature = "mock-adapter")]
pub use mock::{AdapterCall, BatchBehavior, MockDeviceAdapter};
