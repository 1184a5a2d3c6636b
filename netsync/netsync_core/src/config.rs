//! Runtime configuration for the synchronization core.
//!
//! Every value here is instance-scoped: it is read once, validated and passed
//! to the components that need it at construction.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use netsync_shared_types::{NodeId, Result, SyncError};

/// What happens when a parking-state write does not follow the allowed
/// transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// Reject the write with `IllegalTransition`; state is left untouched.
    #[default]
    Strict,
    /// Log a warning and apply the write anyway.
    Lenient,
}

/// Where the liveness tracker takes the last-seen time of a flow it has not
/// observed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessBootstrap {
    /// Use the `last_seen_ms` recorded in the store, which is the time of
    /// the last store write for the flow (its storing or its latest report
    /// on any node). A flow whose stored entry has not been written for
    /// longer than its timeout, such as one no node reported during an
    /// outage, expires on the first unchanged report this process sees.
    #[default]
    StoredLastSeen,
    /// Start the idle clock at the first report this process sees.
    CurrentTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub verification_policy: VerificationPolicy,
    pub liveness_bootstrap: LivenessBootstrap,
    /// Deadline used by `BatchFuture::get_default`.
    pub batch_timeout_ms: u64,
    /// Undelivered events each dispatcher holds before dropping new ones.
    pub event_queue_capacity: usize,
    pub local_node: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            verification_policy: VerificationPolicy::Strict,
            liveness_bootstrap: LivenessBootstrap::StoredLastSeen,
            batch_timeout_ms: 5000,
            event_queue_capacity: 1024,
            local_node: "node-1".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SyncError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::ConfigError(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_timeout_ms == 0 {
            return Err(SyncError::ConfigError(
                "batch_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(SyncError::ConfigError(
                "event_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.local_node.trim().is_empty() {
            return Err(SyncError::ConfigError("local_node must not be empty".into()));
        }
        Ok(())
    }

    pub fn local_node_id(&self) -> NodeId {
        NodeId::new(self.local_node.clone())
    }

    pub fn batch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_timeout_ms)
    }
}
