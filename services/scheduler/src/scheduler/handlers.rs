//! Handler pipeline.
//!
//! Every event kind maps to an ordered chain of handlers. The loop runs the
//! chain front to back; a handler returning [`HandlerFlow::Stop`] ends it.
//! Chains are plain data, so embedders and tests can append their own
//! handlers or inspect the registered order.

use std::collections::HashMap;

use berth_id::TaskId;
use tracing::{debug, error, info, trace, warn};

use super::core::SchedulerCore;
use super::event::{respond, EventKind, QueryResult, SchedulerEvent, UserEvent};
use crate::connector::ConnectorEvent;

/// Whether the rest of the chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFlow {
    Continue,
    Stop,
}

pub type Handler = fn(&mut SchedulerCore, &mut SchedulerEvent) -> HandlerFlow;

#[derive(Default)]
pub struct HandlerManager {
    chains: HashMap<EventKind, Vec<(&'static str, Handler)>>,
}

impl HandlerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The logger on every kind, followed by the built-in handlers.
    pub fn with_defaults() -> Self {
        let mut manager = Self::new();
        for kind in EventKind::ALL {
            manager.register(kind, "logger", log_event);
        }

        manager.register(EventKind::Subscribed, "subscribed", handle_subscribed);
        manager.register(EventKind::Heartbeat, "heartbeat", handle_heartbeat);
        manager.register(EventKind::Offers, "offers", handle_offers);
        manager.register(EventKind::Rescind, "rescind", handle_rescind);
        manager.register(EventKind::Update, "validate_update", validate_update);
        manager.register(EventKind::Update, "apply_update", apply_update);
        for kind in EventKind::ALL.into_iter().filter(EventKind::is_user) {
            manager.register(kind, "user", handle_user);
        }
        manager
    }

    /// Appends `handler` to the chain for `kind`.
    pub fn register(&mut self, kind: EventKind, name: &'static str, handler: Handler) {
        self.chains.entry(kind).or_default().push((name, handler));
    }

    /// Runs the chain for `event`. Returns how many handlers ran.
    pub fn dispatch(&self, core: &mut SchedulerCore, event: &mut SchedulerEvent) -> usize {
        let kind = event.kind();
        let Some(chain) = self.chains.get(&kind) else {
            debug!(event = %kind, "No handlers registered");
            return 0;
        };

        let mut ran = 0;
        for (name, handler) in chain {
            ran += 1;
            if handler(core, event) == HandlerFlow::Stop {
                trace!(event = %kind, handler = *name, "Handler chain stopped");
                break;
            }
        }
        ran
    }

    /// Handler names registered for `kind`, in order.
    pub fn chain(&self, kind: EventKind) -> Vec<&'static str> {
        self.chains
            .get(&kind)
            .map(|chain| chain.iter().map(|(name, _)| *name).collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// Built-in handlers
// =============================================================================

fn log_event(_core: &mut SchedulerCore, event: &mut SchedulerEvent) -> HandlerFlow {
    match event {
        SchedulerEvent::Connector(ConnectorEvent::Error { message }) => {
            error!(message = %message, "Resource manager error");
        }
        SchedulerEvent::Connector(ConnectorEvent::Failure {
            agent_id,
            executor_id,
            status,
        }) => {
            warn!(agent_id = ?agent_id, executor_id = ?executor_id, status = ?status, "Agent or executor failure");
        }
        SchedulerEvent::Connector(ConnectorEvent::Heartbeat) => {
            trace!("Heartbeat");
        }
        SchedulerEvent::Connector(ConnectorEvent::Offers(offers)) => {
            debug!(offers = offers.len(), "Offers received");
        }
        SchedulerEvent::Connector(ConnectorEvent::Update(status)) => {
            debug!(
                task_id = %status.task_id,
                state = ?status.state,
                healthy = ?status.healthy,
                reason = ?status.reason,
                "Task status update"
            );
        }
        SchedulerEvent::Connector(ConnectorEvent::Message {
            agent_id,
            executor_id,
            data,
        }) => {
            debug!(agent_id = %agent_id, executor_id = %executor_id, bytes = data.len(), "Executor message");
        }
        SchedulerEvent::Connector(other) => {
            debug!(event = other.kind(), "Connector event");
        }
        SchedulerEvent::User(user) => {
            info!(event = %event_kind(user), app_id = ?user.app_id(), "User request");
        }
    }
    HandlerFlow::Continue
}

fn event_kind(user: &UserEvent) -> &'static str {
    match user {
        UserEvent::Deploy { .. } => "deploy",
        UserEvent::Scale { .. } => "scale",
        UserEvent::Update { .. } => "update",
        UserEvent::CancelUpdate { .. } => "cancel_update",
        UserEvent::Delete { .. } => "delete",
        UserEvent::InvalidApps { .. } => "invalid_apps",
        UserEvent::Query { .. } => "query",
    }
}

fn handle_subscribed(core: &mut SchedulerCore, event: &mut SchedulerEvent) -> HandlerFlow {
    if let SchedulerEvent::Connector(ConnectorEvent::Subscribed { framework_id }) = event {
        info!(framework_id = %framework_id, "Subscribed to resource manager");
        core.handle_subscribed(framework_id);
    }
    HandlerFlow::Continue
}

fn handle_heartbeat(core: &mut SchedulerCore, _event: &mut SchedulerEvent) -> HandlerFlow {
    core.handle_heartbeat();
    HandlerFlow::Continue
}

fn handle_offers(core: &mut SchedulerCore, event: &mut SchedulerEvent) -> HandlerFlow {
    if let SchedulerEvent::Connector(ConnectorEvent::Offers(offers)) = event {
        core.handle_offers(std::mem::take(offers));
    }
    HandlerFlow::Continue
}

fn handle_rescind(core: &mut SchedulerCore, event: &mut SchedulerEvent) -> HandlerFlow {
    if let SchedulerEvent::Connector(ConnectorEvent::Rescind(offer_id)) = event {
        core.handle_rescind(offer_id);
    }
    HandlerFlow::Continue
}

/// Drops updates whose task id cannot be parsed.
fn validate_update(_core: &mut SchedulerCore, event: &mut SchedulerEvent) -> HandlerFlow {
    if let SchedulerEvent::Connector(ConnectorEvent::Update(status)) = event {
        if let Err(e) = TaskId::parse(&status.task_id) {
            warn!(task_id = %status.task_id, error = %e, "Dropping update with malformed task id");
            return HandlerFlow::Stop;
        }
    }
    HandlerFlow::Continue
}

fn apply_update(core: &mut SchedulerCore, event: &mut SchedulerEvent) -> HandlerFlow {
    if let SchedulerEvent::Connector(ConnectorEvent::Update(status)) = event {
        if let Ok(task_id) = TaskId::parse(&status.task_id) {
            core.handle_status_update(&task_id, status);
        }
    }
    HandlerFlow::Continue
}

fn handle_user(core: &mut SchedulerCore, event: &mut SchedulerEvent) -> HandlerFlow {
    let SchedulerEvent::User(user) = event else {
        return HandlerFlow::Continue;
    };

    match user {
        UserEvent::Deploy { spec, reply } => {
            let result = core.deploy(spec.clone());
            respond(reply, result);
        }
        UserEvent::Scale {
            app_id,
            instances,
            ips,
            reply,
        } => {
            let result = core.scale(app_id, *instances, std::mem::take(ips));
            respond(reply, result);
        }
        UserEvent::Update {
            app_id,
            version,
            reply,
        } => {
            let result = core.update(app_id, version.clone());
            respond(reply, result);
        }
        UserEvent::CancelUpdate { app_id, reply } => {
            let result = core.cancel_update(app_id);
            respond(reply, result);
        }
        UserEvent::Delete { app_id, reply } => {
            let result = core.delete(app_id);
            respond(reply, result);
        }
        UserEvent::InvalidApps { reply } => {
            let removed = core.invalidate_apps();
            respond(reply, Ok(removed));
        }
        UserEvent::Query { app_id, reply } => {
            let result = QueryResult {
                apps: core.summaries(app_id.as_ref()),
                healthy_tasks: core.healthy_task_events(app_id.as_ref()),
            };
            respond(reply, Ok(result));
        }
    }
    HandlerFlow::Continue
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::EventBus;
    use crate::connector::{Command, CommandSink, TaskState, TaskStatus};
    use crate::error::{SchedulerError, SchedulerResult};
    use crate::state::version::fixtures::version;
    use crate::state::{AppSpec, RestartPolicyConfig, SimpleConstraints};
    use crate::store::StateStore;
    use berth_events::AppMode;
    use berth_id::{AppId, OfferId};
    use tokio::sync::{mpsc, oneshot};

    fn core() -> (SchedulerCore, mpsc::Receiver<Command>) {
        let (commands, rx) = CommandSink::channel(64);
        let core = SchedulerCore::new(
            Arc::new(StateStore::in_memory()),
            EventBus::new(64),
            commands,
            Arc::new(SimpleConstraints),
            RestartPolicyConfig::default(),
            "dc1",
        );
        (core, rx)
    }

    fn deploy(name: &str) -> (SchedulerEvent, oneshot::Receiver<SchedulerResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let event = SchedulerEvent::User(UserEvent::Deploy {
            spec: AppSpec {
                id: AppId::parse(name).unwrap(),
                mode: AppMode::Replicated,
                version: version(),
            },
            reply: Some(tx),
        });
        (event, rx)
    }

    #[test]
    fn test_logger_runs_first_on_every_chain() {
        let manager = HandlerManager::with_defaults();
        for kind in EventKind::ALL {
            assert_eq!(manager.chain(kind).first(), Some(&"logger"), "{kind}");
        }
        assert_eq!(
            manager.chain(EventKind::Update),
            vec!["logger", "validate_update", "apply_update"]
        );
    }

    #[test]
    fn test_malformed_update_stops_chain() {
        let manager = HandlerManager::with_defaults();
        let (mut core, _rx) = core();
        let mut event = SchedulerEvent::Connector(ConnectorEvent::Update(TaskStatus::new(
            "not a task",
            TaskState::Running,
        )));
        assert_eq!(manager.dispatch(&mut core, &mut event), 2);
    }

    #[test]
    fn test_user_handler_replies() {
        let manager = HandlerManager::with_defaults();
        let (mut core, _rx) = core();

        let (mut event, mut rx) = deploy("web");
        assert_eq!(manager.dispatch(&mut core, &mut event), 2);
        assert!(rx.try_recv().unwrap().is_ok());

        let (mut event, mut rx) = deploy("web");
        manager.dispatch(&mut core, &mut event);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(SchedulerError::AppExists(_))
        ));
    }

    #[test]
    fn test_custom_handler_appends() {
        fn stop(_core: &mut SchedulerCore, _event: &mut SchedulerEvent) -> HandlerFlow {
            HandlerFlow::Stop
        }

        let mut manager = HandlerManager::new();
        manager.register(EventKind::Heartbeat, "stop", stop);
        manager.register(EventKind::Heartbeat, "never", handle_heartbeat);

        let (mut core, _rx) = core();
        let mut event = SchedulerEvent::Connector(ConnectorEvent::Heartbeat);
        assert_eq!(manager.dispatch(&mut core, &mut event), 1);
        assert!(core.last_heartbeat().is_none());

        let offer_id = OfferId::parse("o-1").unwrap();
        let mut event = SchedulerEvent::Connector(ConnectorEvent::Rescind(offer_id));
        assert_eq!(manager.dispatch(&mut core, &mut event), 0);
    }
}
