//! Idle-timeout tracking for non-permanent flows.
//!
//! The tracker is process-local and never persisted: after a restart it is
//! rebuilt from the reports that come in.

use dashmap::DashMap;
use tracing::trace;

use netsync_shared_types::{FlowEntry, FlowKey};

use crate::config::LivenessBootstrap;

pub struct LivenessTracker {
    last_seen: DashMap<FlowKey, u64>,
    bootstrap: LivenessBootstrap,
}

impl LivenessTracker {
    pub fn new(bootstrap: LivenessBootstrap) -> Self {
        Self {
            last_seen: DashMap::new(),
            bootstrap,
        }
    }

    /// Decides whether `reported` is still alive, given what the store holds.
    ///
    /// Permanent flows always live. A changed packet counter refreshes the
    /// last-seen time. Otherwise the flow lives while it has been idle for no
    /// longer than its timeout.
    pub fn check(&self, reported: &FlowEntry, stored: &FlowEntry, now_ms: u64) -> bool {
        if stored.is_permanent() {
            return true;
        }
        let key = stored.key();
        let timeout_ms = u64::from(stored.timeout()) * 1000;

        if reported.packets != stored.packets {
            self.last_seen.insert(key, now_ms);
            return true;
        }

        let last = *self.last_seen.entry(key.clone()).or_insert_with(|| match self.bootstrap {
            LivenessBootstrap::StoredLastSeen => stored.last_seen_ms,
            LivenessBootstrap::CurrentTime => now_ms,
        });
        let idle_ms = now_ms.saturating_sub(last);
        trace!(key = ?key, idle_ms, timeout_ms, "Checking flow liveness");
        idle_ms <= timeout_ms
    }

    pub fn forget(&self, key: &FlowKey) {
        self.last_seen.remove(key);
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}
