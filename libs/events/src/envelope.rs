//! Lifecycle event envelope and payload.

use std::net::IpAddr;

use berth_id::{AppId, SlotId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppMode, SlotState, TaskEventType};

/// How listeners reach an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Endpoint {
    /// Stable per-index IP.
    Fixed { ip: Option<IpAddr> },
    /// Agent host plus the first assigned host port. Empty until placed.
    Replicated {
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port_name: Option<String>,
    },
}

impl Endpoint {
    pub fn mode(&self) -> AppMode {
        match self {
            Endpoint::Fixed { .. } => AppMode::Fixed,
            Endpoint::Replicated { .. } => AppMode::Replicated,
        }
    }
}

/// Snapshot of one slot at the moment an event was emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfoEvent {
    pub slot_id: SlotId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub app_id: AppId,
    pub state: SlotState,
    pub healthy: bool,
    pub cluster_id: String,
    pub run_as: String,
    pub endpoint: Endpoint,
}

/// A lifecycle event for one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Monotonic per-process sequence number.
    pub sequence: u64,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The event type (e.g. `task_state_running`, `task_healthy`).
    pub event_type: TaskEventType,

    pub app_id: AppId,
    pub app_mode: AppMode,

    /// Event-specific payload.
    pub payload: TaskInfoEvent,
}

impl LifecycleEvent {
    /// Builds an event stamped with the current time.
    pub fn new(sequence: u64, event_type: TaskEventType, payload: TaskInfoEvent) -> Self {
        Self {
            sequence,
            occurred_at: Utc::now(),
            event_type,
            app_id: payload.app_id.clone(),
            app_mode: payload.endpoint.mode(),
            payload,
        }
    }

    pub fn slot_id(&self) -> &SlotId {
        &self.payload.slot_id
    }

    pub fn is_health_event(&self) -> bool {
        matches!(
            self.event_type,
            TaskEventType::Healthy | TaskEventType::Unhealthy
        )
    }
}
