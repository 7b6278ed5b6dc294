//! Slot states, app modes and lifecycle event types.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All lifecycle event type names as constants.
pub mod event_types {
    // Slot state
    pub const TASK_STATE_PENDING_OFFER: &str = "task_state_pending_offer";
    pub const TASK_STATE_PENDING_KILL: &str = "task_state_pending_kill";
    pub const TASK_STATE_REAP: &str = "task_state_reap";
    pub const TASK_STATE_STAGING: &str = "task_state_staging";
    pub const TASK_STATE_STARTING: &str = "task_state_starting";
    pub const TASK_STATE_RUNNING: &str = "task_state_running";
    pub const TASK_STATE_KILLING: &str = "task_state_killing";
    pub const TASK_STATE_FINISHED: &str = "task_state_finished";
    pub const TASK_STATE_FAILED: &str = "task_state_failed";
    pub const TASK_STATE_KILLED: &str = "task_state_killed";
    pub const TASK_STATE_ERROR: &str = "task_state_error";
    pub const TASK_STATE_LOST: &str = "task_state_lost";
    pub const TASK_STATE_DROPPED: &str = "task_state_dropped";
    pub const TASK_STATE_UNREACHABLE: &str = "task_state_unreachable";
    pub const TASK_STATE_GONE: &str = "task_state_gone";
    pub const TASK_STATE_GONE_BY_OPERATOR: &str = "task_state_gone_by_operator";
    pub const TASK_STATE_UNKNOWN: &str = "task_state_unknown";

    // Health
    pub const TASK_HEALTHY: &str = "task_healthy";
    pub const TASK_UNHEALTHY: &str = "task_unhealthy";
}

// =============================================================================
// Slot State
// =============================================================================

/// Lifecycle state of a slot.
///
/// `PendingOffer`, `PendingKill` and `Reap` are scheduler-driven; every other
/// state mirrors an execution state reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    PendingOffer,
    PendingKill,
    Reap,
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Error,
    Lost,
    Dropped,
    Unreachable,
    Gone,
    GoneByOperator,
    Unknown,
}

impl SlotState {
    pub const ALL: [SlotState; 17] = [
        SlotState::PendingOffer,
        SlotState::PendingKill,
        SlotState::Reap,
        SlotState::Staging,
        SlotState::Starting,
        SlotState::Running,
        SlotState::Killing,
        SlotState::Finished,
        SlotState::Failed,
        SlotState::Killed,
        SlotState::Error,
        SlotState::Lost,
        SlotState::Dropped,
        SlotState::Unreachable,
        SlotState::Gone,
        SlotState::GoneByOperator,
        SlotState::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::PendingOffer => "pending_offer",
            SlotState::PendingKill => "pending_kill",
            SlotState::Reap => "reap",
            SlotState::Staging => "staging",
            SlotState::Starting => "starting",
            SlotState::Running => "running",
            SlotState::Killing => "killing",
            SlotState::Finished => "finished",
            SlotState::Failed => "failed",
            SlotState::Killed => "killed",
            SlotState::Error => "error",
            SlotState::Lost => "lost",
            SlotState::Dropped => "dropped",
            SlotState::Unreachable => "unreachable",
            SlotState::Gone => "gone",
            SlotState::GoneByOperator => "gone_by_operator",
            SlotState::Unknown => "unknown",
        }
    }

    /// States driven by the scheduler rather than by execution reports.
    /// Entering them never triggers an app step.
    pub fn is_pending(&self) -> bool {
        matches!(self, SlotState::PendingOffer | SlotState::PendingKill)
    }

    /// Terminal states: nothing is running and nothing will run without a
    /// new dispatch.
    pub fn is_terminal(&self) -> bool {
        match self {
            SlotState::Reap
            | SlotState::Finished
            | SlotState::Failed
            | SlotState::Killed
            | SlotState::Error
            | SlotState::Lost
            | SlotState::Dropped
            | SlotState::Unreachable
            | SlotState::Gone
            | SlotState::GoneByOperator
            | SlotState::Unknown => true,
            SlotState::PendingOffer
            | SlotState::PendingKill
            | SlotState::Staging
            | SlotState::Starting
            | SlotState::Running
            | SlotState::Killing => false,
        }
    }

    /// Terminal-but-undesired states that make a slot eligible for restart.
    pub fn is_abnormal(&self) -> bool {
        match self {
            SlotState::Lost
            | SlotState::Failed
            | SlotState::Finished
            | SlotState::Killed
            | SlotState::Dropped
            | SlotState::Unknown
            | SlotState::Unreachable
            | SlotState::GoneByOperator
            | SlotState::Gone
            | SlotState::Reap => true,
            SlotState::PendingOffer
            | SlotState::PendingKill
            | SlotState::Staging
            | SlotState::Starting
            | SlotState::Running
            | SlotState::Killing
            | SlotState::Error => false,
        }
    }

    /// True once the current task has been handed an offer.
    pub fn is_dispatched(&self) -> bool {
        match self {
            SlotState::PendingOffer | SlotState::PendingKill | SlotState::Reap => false,
            SlotState::Staging
            | SlotState::Starting
            | SlotState::Running
            | SlotState::Killing
            | SlotState::Finished
            | SlotState::Failed
            | SlotState::Killed
            | SlotState::Error
            | SlotState::Lost
            | SlotState::Dropped
            | SlotState::Unreachable
            | SlotState::Gone
            | SlotState::GoneByOperator
            | SlotState::Unknown => true,
        }
    }

    /// True while the current task occupies agent resources.
    pub fn holds_resources(&self) -> bool {
        matches!(
            self,
            SlotState::Staging | SlotState::Starting | SlotState::Running | SlotState::Killing
        )
    }

    /// The lifecycle event emitted when a slot enters this state.
    pub fn event_type(&self) -> TaskEventType {
        TaskEventType::State(*self)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SlotState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SlotState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| EventError::UnknownState(s.to_string()))
    }
}

// =============================================================================
// App Mode
// =============================================================================

/// How instances of an app are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    /// Each instance index owns a stable, pre-assigned IP.
    Fixed,
    /// Instances share agent IPs and are told apart by host ports.
    #[default]
    Replicated,
}

impl AppMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMode::Fixed => "fixed",
            AppMode::Replicated => "replicated",
        }
    }
}

impl std::fmt::Display for AppMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AppMode {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(AppMode::Fixed),
            "replicated" => Ok(AppMode::Replicated),
            other => Err(EventError::UnknownMode(other.to_string())),
        }
    }
}

// =============================================================================
// Lifecycle Event Type
// =============================================================================

/// Type tag of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventType {
    State(SlotState),
    Healthy,
    Unhealthy,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        use event_types::*;
        match self {
            TaskEventType::Healthy => TASK_HEALTHY,
            TaskEventType::Unhealthy => TASK_UNHEALTHY,
            TaskEventType::State(state) => match state {
                SlotState::PendingOffer => TASK_STATE_PENDING_OFFER,
                SlotState::PendingKill => TASK_STATE_PENDING_KILL,
                SlotState::Reap => TASK_STATE_REAP,
                SlotState::Staging => TASK_STATE_STAGING,
                SlotState::Starting => TASK_STATE_STARTING,
                SlotState::Running => TASK_STATE_RUNNING,
                SlotState::Killing => TASK_STATE_KILLING,
                SlotState::Finished => TASK_STATE_FINISHED,
                SlotState::Failed => TASK_STATE_FAILED,
                SlotState::Killed => TASK_STATE_KILLED,
                SlotState::Error => TASK_STATE_ERROR,
                SlotState::Lost => TASK_STATE_LOST,
                SlotState::Dropped => TASK_STATE_DROPPED,
                SlotState::Unreachable => TASK_STATE_UNREACHABLE,
                SlotState::Gone => TASK_STATE_GONE,
                SlotState::GoneByOperator => TASK_STATE_GONE_BY_OPERATOR,
                SlotState::Unknown => TASK_STATE_UNKNOWN,
            },
        }
    }

    /// Health events for a health flag value.
    pub fn for_health(healthy: bool) -> Self {
        if healthy {
            TaskEventType::Healthy
        } else {
            TaskEventType::Unhealthy
        }
    }
}

impl std::fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskEventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            event_types::TASK_HEALTHY => Ok(TaskEventType::Healthy),
            event_types::TASK_UNHEALTHY => Ok(TaskEventType::Unhealthy),
            other => SlotState::ALL
                .into_iter()
                .map(TaskEventType::State)
                .find(|t| t.as_str() == other)
                .ok_or_else(|| EventError::UnknownEventType(other.to_string())),
        }
    }
}

impl Serialize for TaskEventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskEventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
