//! Resource-manager connector seam.
//!
//! A connector owns the conversation with the cluster resource manager. It
//! runs in its own task, pushes [`ConnectorEvent`]s into the scheduler loop
//! and executes the [`Command`]s the loop sends back. The loop never awaits
//! the connector; commands are fire-and-forget and their outcome arrives
//! later as status updates.

mod channel;
mod mock;

pub use channel::{ChannelConnector, ConnectorDriver};
pub use mock::{MockConnector, MockConnectorConfig};

use std::time::Duration;

use async_trait::async_trait;
use berth_events::SlotState;
use berth_id::{AgentId, FrameworkId, OfferId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::state::{Offer, TaskInfo};

// =============================================================================
// Commands
// =============================================================================

/// Instructions from the scheduler to the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Accept `offer_id` and start `tasks` on it.
    Launch {
        offer_id: OfferId,
        agent_id: AgentId,
        tasks: Vec<TaskInfo>,
    },
    Kill {
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },
    /// Ask for the current state of each listed task.
    Reconcile {
        tasks: Vec<(TaskId, Option<AgentId>)>,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Launch { .. } => "launch",
            Command::Kill { .. } => "kill",
            Command::Reconcile { .. } => "reconcile",
        }
    }
}

/// Non-blocking handle for sending commands to the connector.
#[derive(Debug, Clone)]
pub struct CommandSink {
    tx: mpsc::Sender<Command>,
}

impl CommandSink {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Creates a sink and the receiver a connector reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Queues `command` without waiting. Returns `false` if it was dropped.
    pub fn send(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(command = command.kind(), "Command channel full; dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                warn!(command = command.kind(), "Connector gone; dropping command");
                false
            }
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Execution state reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
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

impl From<TaskState> for SlotState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Staging => SlotState::Staging,
            TaskState::Starting => SlotState::Starting,
            TaskState::Running => SlotState::Running,
            TaskState::Killing => SlotState::Killing,
            TaskState::Finished => SlotState::Finished,
            TaskState::Failed => SlotState::Failed,
            TaskState::Killed => SlotState::Killed,
            TaskState::Error => SlotState::Error,
            TaskState::Lost => SlotState::Lost,
            TaskState::Dropped => SlotState::Dropped,
            TaskState::Unreachable => SlotState::Unreachable,
            TaskState::Gone => SlotState::Gone,
            TaskState::GoneByOperator => SlotState::GoneByOperator,
            TaskState::Unknown => SlotState::Unknown,
        }
    }
}

/// A status update for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Raw task id; parsed by the scheduler.
    pub task_id: String,
    pub state: TaskState,
    /// Health check result, when the task has one.
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TaskStatus {
    pub fn new(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            healthy: None,
            agent_id: None,
            message: None,
            reason: None,
        }
    }
}

/// Everything a connector can tell the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Subscribed { framework_id: FrameworkId },
    Heartbeat,
    Offers(Vec<Offer>),
    Rescind(OfferId),
    Update(TaskStatus),
    Failure {
        agent_id: Option<AgentId>,
        executor_id: Option<String>,
        status: Option<i32>,
    },
    Message {
        agent_id: AgentId,
        executor_id: String,
        data: Vec<u8>,
    },
    Error { message: String },
}

impl ConnectorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorEvent::Subscribed { .. } => "subscribed",
            ConnectorEvent::Heartbeat => "heartbeat",
            ConnectorEvent::Offers(_) => "offers",
            ConnectorEvent::Rescind(_) => "rescind",
            ConnectorEvent::Update(_) => "update",
            ConnectorEvent::Failure { .. } => "failure",
            ConnectorEvent::Message { .. } => "message",
            ConnectorEvent::Error { .. } => "error",
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// How the scheduler registers with the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    /// Set when re-registering after a restart.
    pub framework_id: Option<FrameworkId>,
    pub name: String,
    pub user: String,
    pub role: String,
    pub hostname: Option<String>,
    pub failover_timeout: Duration,
    pub checkpoint: bool,
}

impl Default for FrameworkInfo {
    fn default() -> Self {
        Self {
            framework_id: None,
            name: "berth".to_string(),
            user: "root".to_string(),
            role: "*".to_string(),
            hostname: None,
            failover_timeout: Duration::from_secs(7 * 24 * 3600),
            checkpoint: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("disconnected from resource manager: {0}")]
    Disconnected(String),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("scheduler event channel closed")]
    ChannelClosed,
}

/// A resource-manager connection.
///
/// `run` owns the connection until `shutdown` flips to `true` (return
/// `Ok`) or the connection fails (return the error). The first event after
/// a successful registration must be [`ConnectorEvent::Subscribed`].
#[async_trait]
pub trait Connector: Send {
    async fn run(
        self: Box<Self>,
        framework: FrameworkInfo,
        events: mpsc::Sender<ConnectorEvent>,
        commands: mpsc::Receiver<Command>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_id::{AppId, SlotId};

    fn kill() -> Command {
        Command::Kill {
            task_id: TaskId::new(SlotId::new(AppId::parse("web").unwrap(), 0)),
            agent_id: None,
        }
    }

    #[test]
    fn test_sink_drops_when_full() {
        let (sink, mut rx) = CommandSink::channel(1);
        assert!(sink.send(kill()));
        assert!(!sink.send(kill()));
        assert!(rx.try_recv().is_ok());
        assert!(sink.send(kill()));
    }

    #[test]
    fn test_sink_reports_closed() {
        let (sink, rx) = CommandSink::channel(4);
        drop(rx);
        assert!(!sink.send(kill()));
    }

    #[test]
    fn test_task_state_maps_to_slot_state() {
        assert_eq!(SlotState::from(TaskState::GoneByOperator), SlotState::GoneByOperator);
        assert_eq!(SlotState::from(TaskState::Running), SlotState::Running);
    }

    #[test]
    fn test_task_status_wire_format() {
        let status: TaskStatus =
            serde_json::from_str(r#"{"task_id":"0-web.x","state":"lost"}"#).unwrap();
        assert_eq!(status.state, TaskState::Lost);
        assert!(status.healthy.is_none());

        let json = serde_json::to_value(TaskStatus::new("0-web.x", TaskState::GoneByOperator))
            .unwrap();
        assert_eq!(json["state"], "gone_by_operator");
    }
}
