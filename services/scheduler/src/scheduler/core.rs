//! State owned by the scheduler loop and the operations handlers run on it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use berth_events::{LifecycleEvent, SlotState};
use berth_id::{AgentId, AppId, FrameworkId, OfferId, TaskId};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::connector::{Command, CommandSink, TaskStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::state::{
    App, AppSpec, AppStatus, AppSummary, ConstraintEvaluator, Offer, OfferAllocator, OfferWrapper,
    RestartPolicyConfig, Services, Slot, Version,
};
use crate::store::StateStore;

/// Collaborators lent to app and slot operations.
struct Shared {
    store: Arc<StateStore>,
    allocator: OfferAllocator,
    events: EventBus,
    commands: CommandSink,
    constraints: Arc<dyn ConstraintEvaluator>,
    restart_defaults: RestartPolicyConfig,
}

impl Shared {
    fn services(&mut self) -> Services<'_> {
        Services {
            store: &self.store,
            allocator: &mut self.allocator,
            events: &self.events,
            commands: &self.commands,
            constraints: self.constraints.as_ref(),
            restart_defaults: &self.restart_defaults,
        }
    }
}

pub struct SchedulerCore {
    apps: BTreeMap<AppId, App>,
    shared: Shared,
    cluster_id: String,
    framework_id: Option<FrameworkId>,
    last_heartbeat: Option<Instant>,
}

impl SchedulerCore {
    pub fn new(
        store: Arc<StateStore>,
        events: EventBus,
        commands: CommandSink,
        constraints: Arc<dyn ConstraintEvaluator>,
        restart_defaults: RestartPolicyConfig,
        cluster_id: impl Into<String>,
    ) -> Self {
        Self {
            apps: BTreeMap::new(),
            shared: Shared {
                store,
                allocator: OfferAllocator::new(),
                events,
                commands,
                constraints,
                restart_defaults,
            },
            cluster_id: cluster_id.into(),
            framework_id: None,
            last_heartbeat: None,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn app(&self, app_id: &AppId) -> Option<&App> {
        self.apps.get(app_id)
    }

    pub fn apps(&self) -> impl Iterator<Item = &App> {
        self.apps.values()
    }

    pub fn allocator(&self) -> &OfferAllocator {
        &self.shared.allocator
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn store(&self) -> &StateStore {
        &self.shared.store
    }

    pub fn framework_id(&self) -> Option<&FrameworkId> {
        self.framework_id.as_ref()
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Reloads apps, slots, tasks, reservations and the framework id, then
    /// queues every slot that was waiting for an offer.
    pub fn recover(&mut self) -> SchedulerResult<()> {
        let store = Arc::clone(&self.shared.store);

        self.framework_id = store.get_framework_id()?;

        let mut reservations = store.load_offer_allocator_state()?;
        let data = store.load_app_data()?;

        self.apps.clear();
        for app_data in data {
            let slots: Vec<Slot> = app_data
                .slots
                .into_iter()
                .map(|slot| Slot::from_record(slot.slot, slot.tasks))
                .collect();
            let app = App::from_record(app_data.app, slots);
            self.apps.insert(app.id().clone(), app);
        }

        reservations.retain(|slot_id, _| {
            self.apps
                .get(slot_id.app_id())
                .and_then(|app| app.slot(slot_id.index()))
                .is_some_and(|slot| slot.reservation().is_some())
        });
        let reserved = reservations.len();
        self.shared.allocator = OfferAllocator::new();
        self.shared.allocator.restore(reservations);

        let mut pending = 0;
        for app in self.apps.values() {
            for slot in app.slots() {
                if slot.state() == SlotState::PendingOffer && slot.current_task().is_some() {
                    self.shared
                        .allocator
                        .put_slot_back_to_pending_queue(slot.id().clone());
                    pending += 1;
                }
            }
        }

        info!(
            apps = self.apps.len(),
            pending,
            reserved,
            framework_id = ?self.framework_id,
            "Scheduler state recovered"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Connector events
    // -------------------------------------------------------------------------

    /// Persists the framework id and asks for the state of every live task.
    pub fn handle_subscribed(&mut self, framework_id: &FrameworkId) {
        if self.framework_id.as_ref() != Some(framework_id) {
            if let Err(e) = self.shared.store.put_framework_id(framework_id) {
                warn!(framework_id = %framework_id, error = %e, "Failed to persist framework id");
            }
            self.framework_id = Some(framework_id.clone());
        }

        let tasks: Vec<(TaskId, Option<AgentId>)> = self
            .apps
            .values()
            .flat_map(App::slots)
            .filter(|slot| slot.state().holds_resources() || slot.state() == SlotState::PendingKill)
            .filter_map(|slot| slot.current_task())
            .map(|task| (task.id.clone(), task.agent_id.clone()))
            .collect();

        info!(tasks = tasks.len(), "Reconciling tasks");
        self.shared.commands.send(Command::Reconcile { tasks });
    }

    pub fn handle_heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }

    /// Matches each offer against the pending queue. Returns the number of
    /// tasks launched.
    pub fn handle_offers(&mut self, offers: Vec<Offer>) -> usize {
        offers.into_iter().map(|offer| self.place_offer(offer)).sum()
    }

    /// Fills one offer from the pending queue in FIFO order.
    pub fn place_offer(&mut self, offer: Offer) -> usize {
        let mut ow = OfferWrapper::new(offer);
        let mut launches = Vec::new();

        for slot_id in self.shared.allocator.pending_slots() {
            let Some(app) = self.apps.get_mut(slot_id.app_id()) else {
                self.shared.allocator.remove_from_pending_queue(&slot_id);
                continue;
            };

            let mut svc = self.shared.services();
            let outcome = app.with_slot(slot_id.index(), &mut svc, |slot, env| {
                if slot.state() != SlotState::PendingOffer {
                    env.allocator.remove_from_pending_queue(slot.id());
                    return None;
                }
                if !slot.test_offer_match(&ow, env) {
                    return None;
                }
                match slot.reserve_offer_and_prepare_task_info(&mut ow, env) {
                    Ok(info) => {
                        slot.set_state(SlotState::Staging, env);
                        Some(info)
                    }
                    Err(e) => {
                        warn!(slot_id = %slot.id(), error = %e, "Reservation failed");
                        None
                    }
                }
            });

            match outcome {
                Some(Some(info)) => launches.push(info),
                Some(None) => {}
                None => {
                    svc.allocator.remove_from_pending_queue(&slot_id);
                }
            }
        }

        let offer = ow.offer();
        if launches.is_empty() {
            debug!(offer_id = %offer.id, pending = self.shared.allocator.pending_len(), "Offer unused");
            return 0;
        }

        let launched = launches.len();
        let task_ids: Vec<TaskId> = launches.iter().map(|t| t.task_id.clone()).collect();
        let sent = self.shared.commands.send(Command::Launch {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            tasks: launches,
        });
        if !sent {
            warn!(offer_id = %offer.id, tasks = launched, "Launch dropped; undoing placement");
            self.abandon_launches(&task_ids);
            return 0;
        }

        info!(
            offer_id = %offer.id,
            agent_id = %offer.agent_id,
            tasks = launched,
            cpus_used = ow.cpus_used(),
            mem_used = ow.mem_used(),
            "Launching tasks"
        );
        launched
    }

    /// Requeues slots staged for launches that never left the scheduler.
    fn abandon_launches(&mut self, task_ids: &[TaskId]) {
        for task_id in task_ids {
            let slot_id = task_id.slot_id();
            let Some(app) = self.apps.get_mut(slot_id.app_id()) else {
                continue;
            };
            let mut svc = self.shared.services();
            app.with_slot(slot_id.index(), &mut svc, |slot, env| {
                slot.abandon_launch(task_id, env)
            });
        }
    }

    pub fn handle_rescind(&mut self, offer_id: &OfferId) {
        let slots = self.shared.allocator.slots_on_offer(offer_id);
        debug!(offer_id = %offer_id, reserved_slots = ?slots, "Offer rescinded");
    }

    /// Applies a status update for `task_id`.
    pub fn handle_status_update(&mut self, task_id: &TaskId, status: &TaskStatus) {
        let slot_id = task_id.slot_id();
        let state = SlotState::from(status.state);
        let now = Instant::now();

        let known = self
            .apps
            .get(slot_id.app_id())
            .is_some_and(|app| app.slot(slot_id.index()).is_some());
        if !known {
            self.handle_orphan(task_id, status);
            return;
        }

        let Some(app) = self.apps.get_mut(slot_id.app_id()) else {
            return;
        };
        let mut svc = self.shared.services();
        app.with_slot(slot_id.index(), &mut svc, |slot, env| {
            let Some(current) = slot.current_task() else {
                debug!(task_id = %task_id, "Slot has no current task; ignoring update");
                return;
            };
            if &current.id != task_id {
                let archived = slot.task_history().iter().any(|t| &t.id == task_id);
                if !archived && state.holds_resources() {
                    warn!(task_id = %task_id, state = %state, "Unknown attempt is live; killing it");
                    env.commands.send(Command::Kill {
                        task_id: task_id.clone(),
                        agent_id: status.agent_id.clone(),
                    });
                } else {
                    debug!(task_id = %task_id, state = %state, "Ignoring update for stale task");
                }
                return;
            }

            if let Some(message) = &status.message {
                slot.note_task_message(message.clone(), env);
            }
            if slot.state() != state {
                slot.set_state(state, env);
            }
            if let Some(healthy) = status.healthy {
                if healthy != slot.healthy() {
                    slot.set_healthy(healthy, env);
                }
            }
            slot.test_and_restart(now, env);
        });
    }

    fn handle_orphan(&mut self, task_id: &TaskId, status: &TaskStatus) {
        let state = SlotState::from(status.state);
        if state.holds_resources() {
            warn!(task_id = %task_id, state = %state, "Killing task of unknown slot");
            self.shared.commands.send(Command::Kill {
                task_id: task_id.clone(),
                agent_id: status.agent_id.clone(),
            });
        } else {
            debug!(task_id = %task_id, state = %state, "Ignoring update for unknown slot");
        }
    }

    // -------------------------------------------------------------------------
    // User operations
    // -------------------------------------------------------------------------

    pub fn deploy(&mut self, spec: AppSpec) -> SchedulerResult<()> {
        if self.apps.contains_key(&spec.id) {
            return Err(SchedulerError::AppExists(spec.id));
        }
        let mut svc = self.shared.services();
        let app = App::create(spec, &self.cluster_id, &mut svc)?;
        self.apps.insert(app.id().clone(), app);
        Ok(())
    }

    pub fn scale(&mut self, app_id: &AppId, instances: u32, ips: Vec<IpAddr>) -> SchedulerResult<()> {
        let app = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| SchedulerError::AppNotFound(app_id.clone()))?;
        let mut svc = self.shared.services();
        app.scale(instances, ips, &mut svc)
    }

    pub fn update(&mut self, app_id: &AppId, version: Version) -> SchedulerResult<()> {
        let app = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| SchedulerError::AppNotFound(app_id.clone()))?;
        let mut svc = self.shared.services();
        app.update(version, &mut svc)
    }

    pub fn cancel_update(&mut self, app_id: &AppId) -> SchedulerResult<()> {
        let app = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| SchedulerError::AppNotFound(app_id.clone()))?;
        let mut svc = self.shared.services();
        app.cancel_update(&mut svc)
    }

    /// Marks the app deleted, kills its slots and removes it right away if
    /// nothing was running.
    pub fn delete(&mut self, app_id: &AppId) -> SchedulerResult<()> {
        let app = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| SchedulerError::AppNotFound(app_id.clone()))?;
        let mut svc = self.shared.services();
        app.delete(&mut svc)?;
        self.invalidate_apps();
        Ok(())
    }

    /// Removes every deleted app whose slots have all stopped.
    pub fn invalidate_apps(&mut self) -> Vec<AppId> {
        let done: Vec<AppId> = self
            .apps
            .values()
            .filter(|app| app.can_be_clean_after_deletion())
            .map(|app| app.id().clone())
            .collect();

        for app_id in &done {
            if let Some(app) = self.apps.remove(app_id) {
                let mut svc = self.shared.services();
                app.remove(&mut svc);
            }
        }
        done
    }

    /// Restarts abnormal slots whose policy is due. Returns how many.
    pub fn sweep_restarts(&mut self, now: Instant) -> usize {
        let mut restarted = 0;
        for app in self.apps.values_mut() {
            if *app.status() == AppStatus::Deleting {
                continue;
            }
            let candidates: Vec<u32> = app
                .slots()
                .filter(|slot| slot.abnormal() && slot.restart_policy().is_armed())
                .map(Slot::index)
                .collect();
            for index in candidates {
                let mut svc = self.shared.services();
                if app.with_slot(index, &mut svc, |slot, env| slot.test_and_restart(now, env))
                    == Some(true)
                {
                    restarted += 1;
                }
            }
        }
        if restarted > 0 {
            debug!(restarted, "Restart sweep");
        }
        restarted
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn healthy_task_events(&mut self, app_id: Option<&AppId>) -> Vec<LifecycleEvent> {
        let svc = self.shared.services();
        self.apps
            .values()
            .filter(|app| app_id.is_none_or(|id| app.id() == id))
            .flat_map(|app| app.healthy_task_events(&svc))
            .collect()
    }

    pub fn summaries(&self, app_id: Option<&AppId>) -> Vec<AppSummary> {
        self.apps
            .values()
            .filter(|app| app_id.is_none_or(|id| app.id() == id))
            .map(App::summary)
            .collect()
    }
}
