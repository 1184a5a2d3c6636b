//! Intents: durable declarations of desired connectivity and their lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::flow::{FlowRule, TrafficSelector};
use crate::{ApplicationId, DeviceId, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(Uuid);

impl IntentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectPoint {
    pub device_id: DeviceId,
    pub port: u32,
}

impl ConnectPoint {
    pub fn new(device_id: DeviceId, port: u32) -> Self {
        Self { device_id, port }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    /// Connectivity between two ports, compiled by a registered compiler.
    PointToPoint {
        ingress: ConnectPoint,
        egress: ConnectPoint,
        selector: TrafficSelector,
    },
    /// Installable form: the concrete flow rules realising a parent intent.
    FlowRules { rules: Vec<FlowRule> },
}

impl IntentKind {
    pub fn name(&self) -> &'static str {
        match self {
            IntentKind::PointToPoint { .. } => "point-to-point",
            IntentKind::FlowRules { .. } => "flow-rules",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub app_id: ApplicationId,
    pub priority: u16,
    pub kind: IntentKind,
}

impl Intent {
    pub fn new(app_id: ApplicationId, priority: u16, kind: IntentKind) -> Self {
        Self {
            id: IntentId::new(),
            app_id,
            priority,
            kind,
        }
    }

    pub fn is_installable(&self) -> bool {
        matches!(self.kind, IntentKind::FlowRules { .. })
    }

    /// Flow rules carried by an installable intent; empty for anything else.
    pub fn flow_rules(&self) -> &[FlowRule] {
        match &self.kind {
            IntentKind::FlowRules { rules } => rules,
            _ => &[],
        }
    }
}

/// Lifecycle state of an intent.
///
/// Parking states are agreed across the cluster; the others are transient
/// sub-states only the owning process ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentState {
    Submitted,
    Compiling,
    Installing,
    Installed,
    Recompiling,
    Withdrawing,
    Withdrawn,
    Failed,
}

impl IntentState {
    pub fn is_parking(self) -> bool {
        matches!(
            self,
            IntentState::Submitted
                | IntentState::Installed
                | IntentState::Withdrawn
                | IntentState::Failed
        )
    }

    /// Whether `self` may be recorded as the parking state after `previous`.
    ///
    /// Transient states are never guarded.
    pub fn can_follow(self, previous: Option<IntentState>) -> bool {
        use IntentState::*;
        match self {
            Submitted => previous.is_none(),
            Installed => matches!(previous, Some(Submitted | Installed | Failed)),
            Withdrawn => matches!(previous, Some(Installed | Failed)),
            Failed => matches!(previous, Some(Submitted | Installed | Failed)),
            Compiling | Installing | Recompiling | Withdrawing => true,
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntentState::Submitted => "SUBMITTED",
            IntentState::Compiling => "COMPILING",
            IntentState::Installing => "INSTALLING",
            IntentState::Installed => "INSTALLED",
            IntentState::Recompiling => "RECOMPILING",
            IntentState::Withdrawing => "WITHDRAWING",
            IntentState::Withdrawn => "WITHDRAWN",
            IntentState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentEvent {
    Submitted(Intent),
    Installed(Intent),
    Failed(Intent),
    Withdrawn(Intent),
}

impl IntentEvent {
    /// The event announcing that `intent` parked in `state`; `None` for transient states.
    pub fn for_state(state: IntentState, intent: Intent) -> Option<Self> {
        match state {
            IntentState::Submitted => Some(IntentEvent::Submitted(intent)),
            IntentState::Installed => Some(IntentEvent::Installed(intent)),
            IntentState::Failed => Some(IntentEvent::Failed(intent)),
            IntentState::Withdrawn => Some(IntentEvent::Withdrawn(intent)),
            _ => None,
        }
    }

    pub fn subject(&self) -> &Intent {
        match self {
            IntentEvent::Submitted(intent)
            | IntentEvent::Installed(intent)
            | IntentEvent::Failed(intent)
            | IntentEvent::Withdrawn(intent) => intent,
        }
    }
}

impl SyncEvent for IntentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            IntentEvent::Submitted(_) => "INTENT_SUBMITTED",
            IntentEvent::Installed(_) => "INTENT_INSTALLED",
            IntentEvent::Failed(_) => "INTENT_FAILED",
            IntentEvent::Withdrawn(_) => "INTENT_WITHDRAWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IntentState::*;

    #[test]
    fn test_parking_states() {
        assert!(Submitted.is_parking());
        assert!(Installed.is_parking());
        assert!(Withdrawn.is_parking());
        assert!(Failed.is_parking());
        assert!(!Compiling.is_parking());
        assert!(!Installing.is_parking());
        assert!(!Withdrawing.is_parking());
    }

    #[test]
    fn test_installed_predecessors() {
        assert!(Installed.can_follow(Some(Submitted)));
        assert!(Installed.can_follow(Some(Installed)));
        assert!(Installed.can_follow(Some(Failed)));
        assert!(!Installed.can_follow(Some(Withdrawn)));
        assert!(!Installed.can_follow(None));
    }

    #[test]
    fn test_withdrawn_predecessors() {
        assert!(Withdrawn.can_follow(Some(Installed)));
        assert!(Withdrawn.can_follow(Some(Failed)));
        assert!(!Withdrawn.can_follow(Some(Submitted)));
        assert!(!Withdrawn.can_follow(None));
    }

    #[test]
    fn test_transient_states_are_unguarded() {
        assert!(Compiling.can_follow(None));
        assert!(Installing.can_follow(Some(Withdrawn)));
    }

    #[test]
    fn test_event_only_for_parking_states() {
        let intent = Intent::new(
            ApplicationId::new("test"),
            100,
            IntentKind::FlowRules { rules: vec![] },
        );
        assert!(IntentEvent::for_state(Compiling, intent.clone()).is_none());
        assert!(matches!(
            IntentEvent::for_state(Installed, intent),
            Some(IntentEvent::Installed(_))
        ));
    }
}
