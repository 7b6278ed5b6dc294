//! The scheduler loop.
//!
//! A single task owns all scheduler state. It waits on:
//!
//! - the shutdown signal
//! - the connector task finishing
//! - connector events
//! - user requests from [`SchedulerHandle`]s
//! - the restart sweep timer
//! - the deleted-app collection timer
//!
//! Each event runs through the [`HandlerManager`] chain for its kind to
//! completion before the next one is taken, so handlers never race.

mod core;
mod event;
mod handlers;

pub use self::core::SchedulerCore;
pub use event::{respond, EventKind, QueryResult, Reply, SchedulerEvent, UserEvent};
pub use handlers::{Handler, HandlerFlow, HandlerManager};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_events::LifecycleEvent;
use berth_id::AppId;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::bus::{EventBus, DEFAULT_EVENT_BUS_CAPACITY};
use crate::connector::{Command, CommandSink, Connector, ConnectorError, FrameworkInfo};
use crate::error::{SchedulerError, SchedulerResult};
use crate::state::{AppSpec, AppSummary, ConstraintEvaluator, RestartPolicyConfig, SimpleConstraints, Version};
use crate::store::StateStore;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cluster name stamped on every lifecycle event.
    pub cluster_id: String,

    /// Registration descriptor handed to the connector.
    pub framework: FrameworkInfo,

    /// How often abnormal slots are checked for a due restart.
    pub restart_check_interval: Duration,

    /// How often deleted apps with no live slots are removed.
    pub app_gc_interval: Duration,

    pub user_event_capacity: usize,
    pub connector_event_capacity: usize,
    pub command_capacity: usize,
    pub event_bus_capacity: usize,

    /// Restart tuning for versions that do not set their own.
    pub restart_defaults: RestartPolicyConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            framework: FrameworkInfo::default(),
            restart_check_interval: Duration::from_secs(1),
            app_gc_interval: Duration::from_secs(5),
            user_event_capacity: 1024,
            connector_event_capacity: 1024,
            command_capacity: 1024,
            event_bus_capacity: DEFAULT_EVENT_BUS_CAPACITY,
            restart_defaults: RestartPolicyConfig::default(),
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct Scheduler {
    core: SchedulerCore,
    handlers: HandlerManager,
    config: SchedulerConfig,
    user_rx: mpsc::Receiver<UserEvent>,
    commands_rx: Option<mpsc::Receiver<Command>>,
    shutdown_rx: watch::Receiver<bool>,
    handle: SchedulerHandle,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<StateStore>) -> Self {
        Self::with_constraints(config, store, Arc::new(SimpleConstraints))
    }

    pub fn with_constraints(
        config: SchedulerConfig,
        store: Arc<StateStore>,
        constraints: Arc<dyn ConstraintEvaluator>,
    ) -> Self {
        let (commands, commands_rx) = CommandSink::channel(config.command_capacity);
        let (user_tx, user_rx) = mpsc::channel(config.user_event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventBus::new(config.event_bus_capacity);

        let handle = SchedulerHandle {
            user_tx,
            shutdown: Arc::new(shutdown_tx),
            lifecycle: events.sender(),
        };

        let core = SchedulerCore::new(
            store,
            events,
            commands,
            constraints,
            config.restart_defaults.clone(),
            config.cluster_id.clone(),
        );

        Self {
            core,
            handlers: HandlerManager::with_defaults(),
            config,
            user_rx,
            commands_rx: Some(commands_rx),
            shutdown_rx,
            handle,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn core(&self) -> &SchedulerCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
    }

    /// Handler chains, for embedders that register their own handlers.
    pub fn handlers_mut(&mut self) -> &mut HandlerManager {
        &mut self.handlers
    }

    pub fn recover(&mut self) -> SchedulerResult<()> {
        self.core.recover()
    }

    /// Runs `event` through its handler chain.
    pub fn dispatch(&mut self, mut event: SchedulerEvent) -> usize {
        self.handlers.dispatch(&mut self.core, &mut event)
    }

    /// Recovers persisted state, starts `connector` and processes events
    /// until shutdown or until the connector stops.
    #[instrument(skip_all, name = "scheduler")]
    pub async fn run(mut self, connector: Box<dyn Connector>) -> SchedulerResult<()> {
        self.recover()?;

        let mut framework = self.config.framework.clone();
        if let Some(framework_id) = self.core.framework_id() {
            framework.framework_id = Some(framework_id.clone());
        }

        let commands_rx = self.commands_rx.take().ok_or(SchedulerError::Stopped)?;
        let (events_tx, mut events_rx) =
            mpsc::channel(self.config.connector_event_capacity.max(1));

        info!(
            framework = %framework.name,
            framework_id = ?framework.framework_id,
            "Starting scheduler loop"
        );
        let mut connector_task = tokio::spawn(connector.run(
            framework,
            events_tx,
            commands_rx,
            self.shutdown_rx.clone(),
        ));

        let mut restart_tick = tokio::time::interval(self.config.restart_check_interval);
        restart_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut gc_tick = tokio::time::interval(self.config.app_gc_interval);
        gc_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Scheduler received shutdown signal");
                        break;
                    }
                }

                joined = &mut connector_task => {
                    return match joined {
                        Ok(Ok(())) => {
                            info!("Connector stopped");
                            Ok(())
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "Connector failed");
                            Err(e.into())
                        }
                        Err(e) => {
                            error!(error = %e, "Connector task panicked");
                            Err(ConnectorError::Disconnected(e.to_string()).into())
                        }
                    };
                }

                Some(event) = events_rx.recv() => {
                    self.dispatch(SchedulerEvent::Connector(event));
                }

                Some(event) = self.user_rx.recv() => {
                    self.dispatch(SchedulerEvent::User(event));
                }

                _ = restart_tick.tick() => {
                    self.core.sweep_restarts(Instant::now());
                }

                _ = gc_tick.tick() => {
                    let removed = self.core.invalidate_apps();
                    if !removed.is_empty() {
                        debug!(removed = removed.len(), "Collected deleted apps");
                    }
                }
            }
        }

        match connector_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Connector ended with error during shutdown"),
            Err(e) => error!(error = %e, "Connector task panicked"),
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable front door to a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    user_tx: mpsc::Sender<UserEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl SchedulerHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> UserEvent) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.user_tx
            .send(make(Some(tx)))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    pub async fn deploy(&self, spec: AppSpec) -> SchedulerResult<()> {
        self.request(|reply| UserEvent::Deploy { spec, reply }).await
    }

    pub async fn scale(
        &self,
        app_id: AppId,
        instances: u32,
        ips: Vec<IpAddr>,
    ) -> SchedulerResult<()> {
        self.request(|reply| UserEvent::Scale {
            app_id,
            instances,
            ips,
            reply,
        })
        .await
    }

    pub async fn update(&self, app_id: AppId, version: Version) -> SchedulerResult<()> {
        self.request(|reply| UserEvent::Update {
            app_id,
            version,
            reply,
        })
        .await
    }

    pub async fn cancel_update(&self, app_id: AppId) -> SchedulerResult<()> {
        self.request(|reply| UserEvent::CancelUpdate { app_id, reply })
            .await
    }

    pub async fn delete(&self, app_id: AppId) -> SchedulerResult<()> {
        self.request(|reply| UserEvent::Delete { app_id, reply }).await
    }

    /// Removes deleted apps whose slots have all stopped.
    pub async fn invalidate_apps(&self) -> SchedulerResult<Vec<AppId>> {
        self.request(|reply| UserEvent::InvalidApps { reply }).await
    }

    pub async fn query(&self, app_id: Option<AppId>) -> SchedulerResult<QueryResult> {
        self.request(|reply| UserEvent::Query { app_id, reply }).await
    }

    /// One `task_healthy` event per running, healthy slot.
    pub async fn healthy_tasks(&self, app_id: Option<AppId>) -> SchedulerResult<Vec<LifecycleEvent>> {
        Ok(self.query(app_id).await?.healthy_tasks)
    }

    pub async fn summaries(&self) -> SchedulerResult<Vec<AppSummary>> {
        Ok(self.query(None).await?.apps)
    }

    /// Lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
