//! Observability for the synchronization core.
//!
//! - **Tracing**: structured logging setup shared by every binary
//! - **Event dispatch**: per-event-class queues delivering store and
//!   reconciliation events to registered listeners

pub mod events;
pub mod tracing_setup;

pub use events::{
    CollectingListener, DispatchStats, EventDispatcher, EventListener, ListenerId,
    DEFAULT_QUEUE_CAPACITY,
};
pub use tracing_setup::{init_tracing, TracingConfig};

/// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, trace, warn, span, Level};
