//! Events flowing through the scheduler loop.

use std::fmt;
use std::net::IpAddr;

use berth_events::LifecycleEvent;
use berth_id::AppId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::connector::ConnectorEvent;
use crate::error::SchedulerResult;
use crate::state::{AppSpec, AppSummary, Version};

/// Where a user request's answer goes. `None` means nobody is waiting.
pub type Reply<T> = Option<oneshot::Sender<SchedulerResult<T>>>;

/// Sends `result` to the waiting caller, if any.
pub fn respond<T>(reply: &mut Reply<T>, result: SchedulerResult<T>) {
    match reply.take() {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "User request failed");
            }
        }
    }
}

/// Answer to a [`UserEvent::Query`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub apps: Vec<AppSummary>,
    /// One `task_healthy` event per running, healthy slot.
    pub healthy_tasks: Vec<LifecycleEvent>,
}

/// Requests from the user-facing handle.
#[derive(Debug)]
pub enum UserEvent {
    Deploy {
        spec: AppSpec,
        reply: Reply<()>,
    },
    Scale {
        app_id: AppId,
        instances: u32,
        ips: Vec<IpAddr>,
        reply: Reply<()>,
    },
    Update {
        app_id: AppId,
        version: Version,
        reply: Reply<()>,
    },
    CancelUpdate {
        app_id: AppId,
        reply: Reply<()>,
    },
    Delete {
        app_id: AppId,
        reply: Reply<()>,
    },
    /// Removes deleted apps whose slots have all stopped.
    InvalidApps {
        reply: Reply<Vec<AppId>>,
    },
    Query {
        app_id: Option<AppId>,
        reply: Reply<QueryResult>,
    },
}

impl UserEvent {
    pub fn app_id(&self) -> Option<&AppId> {
        match self {
            UserEvent::Deploy { spec, .. } => Some(&spec.id),
            UserEvent::Scale { app_id, .. }
            | UserEvent::Update { app_id, .. }
            | UserEvent::CancelUpdate { app_id, .. }
            | UserEvent::Delete { app_id, .. } => Some(app_id),
            UserEvent::InvalidApps { .. } => None,
            UserEvent::Query { app_id, .. } => app_id.as_ref(),
        }
    }
}

/// Anything the loop hands to the handler pipeline.
#[derive(Debug)]
pub enum SchedulerEvent {
    Connector(ConnectorEvent),
    User(UserEvent),
}

impl SchedulerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::Connector(event) => match event {
                ConnectorEvent::Subscribed { .. } => EventKind::Subscribed,
                ConnectorEvent::Heartbeat => EventKind::Heartbeat,
                ConnectorEvent::Offers(_) => EventKind::Offers,
                ConnectorEvent::Rescind(_) => EventKind::Rescind,
                ConnectorEvent::Update(_) => EventKind::Update,
                ConnectorEvent::Failure { .. } => EventKind::Failure,
                ConnectorEvent::Message { .. } => EventKind::Message,
                ConnectorEvent::Error { .. } => EventKind::Error,
            },
            SchedulerEvent::User(event) => match event {
                UserEvent::Deploy { .. } => EventKind::UserDeploy,
                UserEvent::Scale { .. } => EventKind::UserScale,
                UserEvent::Update { .. } => EventKind::UserUpdate,
                UserEvent::CancelUpdate { .. } => EventKind::UserCancelUpdate,
                UserEvent::Delete { .. } => EventKind::UserDelete,
                UserEvent::InvalidApps { .. } => EventKind::UserInvalidApps,
                UserEvent::Query { .. } => EventKind::UserQuery,
            },
        }
    }
}

/// Handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Subscribed,
    Heartbeat,
    Offers,
    Rescind,
    Update,
    Failure,
    Message,
    Error,
    UserDeploy,
    UserScale,
    UserUpdate,
    UserCancelUpdate,
    UserDelete,
    UserInvalidApps,
    UserQuery,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        EventKind::Subscribed,
        EventKind::Heartbeat,
        EventKind::Offers,
        EventKind::Rescind,
        EventKind::Update,
        EventKind::Failure,
        EventKind::Message,
        EventKind::Error,
        EventKind::UserDeploy,
        EventKind::UserScale,
        EventKind::UserUpdate,
        EventKind::UserCancelUpdate,
        EventKind::UserDelete,
        EventKind::UserInvalidApps,
        EventKind::UserQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Subscribed => "subscribed",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Offers => "offers",
            EventKind::Rescind => "rescind",
            EventKind::Update => "update",
            EventKind::Failure => "failure",
            EventKind::Message => "message",
            EventKind::Error => "error",
            EventKind::UserDeploy => "user_deploy",
            EventKind::UserScale => "user_scale",
            EventKind::UserUpdate => "user_update",
            EventKind::UserCancelUpdate => "user_cancel_update",
            EventKind::UserDelete => "user_delete",
            EventKind::UserInvalidApps => "user_invalid_apps",
            EventKind::UserQuery => "user_query",
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(
            self,
            EventKind::UserDeploy
                | EventKind::UserScale
                | EventKind::UserUpdate
                | EventKind::UserCancelUpdate
                | EventKind::UserDelete
                | EventKind::UserInvalidApps
                | EventKind::UserQuery
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
