//! Flow rules and the stored/reported flow entries that wrap them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::{ApplicationId, DeviceId, ManagedEntity, SyncEvent};

/// Identifier of a flow rule, derived from its owner, priority and match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(u64);

impl FlowId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Store key for a flow rule: flow ids are only unique within a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub device_id: DeviceId,
    pub flow_id: FlowId,
}

/// Match criteria, kept ordered so the derived flow id is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSelector {
    pub criteria: BTreeMap<String, String>,
}

impl TrafficSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.criteria.insert(field.into(), value.into());
        self
    }
}

/// Ordered list of actions applied to matching packets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficTreatment {
    pub instructions: Vec<String>,
}

impl TrafficTreatment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instructions.push(instruction.into());
        self
    }
}

/// A match/action rule intended for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRule {
    pub id: FlowId,
    pub device_id: DeviceId,
    pub app_id: ApplicationId,
    pub priority: u16,
    pub selector: TrafficSelector,
    pub treatment: TrafficTreatment,
    /// Idle timeout in seconds; ignored for permanent rules.
    pub timeout: u32,
    pub permanent: bool,
}

impl FlowRule {
    /// Creates a permanent rule. Use [`FlowRule::with_timeout`] for an expiring one.
    pub fn new(
        device_id: DeviceId,
        app_id: ApplicationId,
        priority: u16,
        selector: TrafficSelector,
        treatment: TrafficTreatment,
    ) -> Self {
        let id = Self::derive_id(&app_id, priority, &selector);
        Self {
            id,
            device_id,
            app_id,
            priority,
            selector,
            treatment,
            timeout: 0,
            permanent: true,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = timeout_secs;
        self.permanent = false;
        self
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            device_id: self.device_id.clone(),
            flow_id: self.id,
        }
    }

    fn derive_id(app_id: &ApplicationId, priority: u16, selector: &TrafficSelector) -> FlowId {
        let mut hasher = Sha256::new();
        hasher.update(app_id.name().as_bytes());
        hasher.update(priority.to_be_bytes());
        for (field, value) in &selector.criteria {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        FlowId(u64::from_be_bytes(bytes))
    }
}

impl ManagedEntity for FlowRule {
    type Key = FlowKey;

    fn key(&self) -> FlowKey {
        self.flow_key()
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn app_id(&self) -> &ApplicationId {
        &self.app_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowEntryState {
    /// Stored, not yet confirmed by the device.
    PendingAdd,
    /// Confirmed installed by a device report.
    Added,
    /// Removal requested; kept until the device stops reporting it.
    PendingRemove,
    /// Removed on the device; awaiting eviction from the store.
    Removed,
    /// The device rejected the rule.
    Failed,
}

/// A flow rule plus the state and counters the controller tracks for it.
///
/// Entries are values: every change produces a new entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub rule: FlowRule,
    pub state: FlowEntryState,
    pub packets: u64,
    pub bytes: u64,
    pub life_secs: u64,
    /// Wall-clock milliseconds of the last store write for this entry: when
    /// it was first stored, then every report that included it, whether or
    /// not its counters moved. Zero on entries built from a device report.
    pub last_seen_ms: u64,
}

impl FlowEntry {
    /// A freshly stored entry awaiting installation.
    pub fn pending(rule: FlowRule, now_ms: u64) -> Self {
        Self {
            rule,
            state: FlowEntryState::PendingAdd,
            packets: 0,
            bytes: 0,
            life_secs: 0,
            last_seen_ms: now_ms,
        }
    }

    /// An entry as reported by a device.
    pub fn reported(rule: FlowRule, packets: u64, bytes: u64, life_secs: u64) -> Self {
        Self {
            rule,
            state: FlowEntryState::Added,
            packets,
            bytes,
            life_secs,
            last_seen_ms: 0,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.rule.flow_key()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.rule.device_id
    }

    pub fn is_permanent(&self) -> bool {
        self.rule.is_permanent()
    }

    pub fn timeout(&self) -> u32 {
        self.rule.timeout
    }

    pub fn with_state(&self, state: FlowEntryState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Copies the counters of a reported entry into a new stored entry and
    /// stamps it with `now_ms`.
    pub fn with_counters_from(&self, reported: &FlowEntry, now_ms: u64) -> Self {
        Self {
            packets: reported.packets,
            bytes: reported.bytes,
            life_secs: reported.life_secs,
            last_seen_ms: now_ms,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowRuleEvent {
    RuleAddRequested(FlowEntry),
    RuleRemoveRequested(FlowEntry),
    RuleAdded(FlowEntry),
    RuleUpdated(FlowEntry),
    RuleRemoved(FlowEntry),
}

impl FlowRuleEvent {
    pub fn subject(&self) -> &FlowEntry {
        match self {
            FlowRuleEvent::RuleAddRequested(entry)
            | FlowRuleEvent::RuleRemoveRequested(entry)
            | FlowRuleEvent::RuleAdded(entry)
            | FlowRuleEvent::RuleUpdated(entry)
            | FlowRuleEvent::RuleRemoved(entry) => entry,
        }
    }
}

impl SyncEvent for FlowRuleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FlowRuleEvent::RuleAddRequested(_) => "RULE_ADD_REQUESTED",
            FlowRuleEvent::RuleRemoveRequested(_) => "RULE_REMOVE_REQUESTED",
            FlowRuleEvent::RuleAdded(_) => "RULE_ADDED",
            FlowRuleEvent::RuleUpdated(_) => "RULE_UPDATED",
            FlowRuleEvent::RuleRemoved(_) => "RULE_REMOVED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(port: &str) -> TrafficSelector {
        TrafficSelector::new().matching("in_port", port)
    }

    #[test]
    fn test_flow_id_is_stable_for_same_match() {
        let a = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            10,
            selector("1"),
            TrafficTreatment::new().instruction("output:2"),
        );
        let b = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            10,
            selector("1"),
            TrafficTreatment::new().instruction("output:3"),
        );
        assert_eq!(a.id, b.id);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_flow_id_differs_by_priority_and_match() {
        let base = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            10,
            selector("1"),
            TrafficTreatment::new(),
        );
        let other_priority = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            11,
            selector("1"),
            TrafficTreatment::new(),
        );
        let other_match = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            10,
            selector("2"),
            TrafficTreatment::new(),
        );
        assert_ne!(base.id, other_priority.id);
        assert_ne!(base.id, other_match.id);
    }

    #[test]
    fn test_with_timeout_makes_rule_expiring() {
        let rule = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            10,
            selector("1"),
            TrafficTreatment::new(),
        )
        .with_timeout(5);
        assert!(!rule.is_permanent());
        assert_eq!(rule.timeout, 5);
    }

    #[test]
    fn test_entry_updates_produce_new_values() {
        let rule = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            10,
            selector("1"),
            TrafficTreatment::new(),
        );
        let stored = FlowEntry::pending(rule.clone(), 100);
        let reported = FlowEntry::reported(rule, 42, 4200, 7);

        let merged = stored.with_counters_from(&reported, 200).with_state(FlowEntryState::Added);
        assert_eq!(stored.state, FlowEntryState::PendingAdd);
        assert_eq!(stored.packets, 0);
        assert_eq!(merged.packets, 42);
        assert_eq!(merged.last_seen_ms, 200);
        assert_eq!(merged.state, FlowEntryState::Added);
    }

    #[test]
    fn test_unchanged_report_still_stamps_last_seen() {
        let rule = FlowRule::new(
            DeviceId::new("of:1"),
            ApplicationId::new("fwd"),
            10,
            selector("1"),
            TrafficTreatment::new(),
        );
        let reported = FlowEntry::reported(rule.clone(), 42, 4200, 7);
        assert_eq!(reported.last_seen_ms, 0);

        let first = FlowEntry::pending(rule, 100).with_counters_from(&reported, 200);
        let second = first.with_counters_from(&reported, 900);
        assert_eq!(second.packets, first.packets);
        assert_eq!(second.last_seen_ms, 900);
    }
}
