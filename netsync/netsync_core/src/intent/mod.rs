//! Intent subsystem: two-tier state store and the lifecycle manager.

pub mod manager;
pub mod store;

pub use manager::{IntentCompiler, IntentManager, PointToPointCompiler};
pub use store::{IntentMaps, IntentStore, INSTALLABLE_INTENTS_MAP, INTENTS_MAP, INTENT_STATES_MAP};
