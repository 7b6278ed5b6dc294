//! Slot state machine.
//!
//! A slot is the durable identity of one instance index. It survives
//! restarts and redeployments; each attempt to run it is a [`Task`].
//!
//! ## Invariants
//!
//! - At most one current (non-archived) task; history only grows
//! - At most one reservation, recorded only while the slot was `PendingOffer`
//! - Every mutation is persisted, coalesced by [`SlotTx`] when several
//!   steps form one logical change
//!
//! `set_state` is the only place the state field changes.

use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use berth_events::{Endpoint, SlotState, TaskEventType, TaskInfoEvent};
use berth_id::{AppId, SlotId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::allocator::OfferInfo;
use super::offer::{AllocError, OfferWrapper, ResourceClaim};
use super::restart::{RestartPolicy, RestartPolicyConfig};
use super::task::{resources_needed, LaunchContext, Resource, Task, TaskInfo};
use super::version::Version;
use super::{AppMeta, SlotEnv};
use crate::store::StateStore;

// =============================================================================
// Persistence Record
// =============================================================================

/// Persisted form of a slot. Tasks are stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub id: SlotId,
    pub version: Version,
    pub state: SlotState,
    pub healthy: bool,
    pub ip: Option<IpAddr>,
    pub current_task_id: Option<TaskId>,
    pub reservation: Option<OfferInfo>,
    pub restart: RestartPolicyConfig,
    pub restart_retries: u32,
    pub restart_stopped: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Slot
// =============================================================================

#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    version: Version,
    state: SlotState,
    healthy: bool,
    ip: Option<IpAddr>,
    current_task: Option<Task>,
    task_history: Vec<Task>,
    reservation: Option<OfferInfo>,
    restart_policy: RestartPolicy,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    tx_depth: u32,
}

impl Slot {
    /// Creates a slot with no task. Callers dispatch it right away.
    pub fn new(id: SlotId, version: Version, ip: Option<IpAddr>, restart: RestartPolicyConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            version,
            state: SlotState::PendingOffer,
            healthy: false,
            ip,
            current_task: None,
            task_history: Vec::new(),
            reservation: None,
            restart_policy: RestartPolicy::new(restart),
            created_at: now,
            updated_at: now,
            tx_depth: 0,
        }
    }

    /// Rebuilds a slot from its record and every task stored for it.
    pub fn from_record(record: SlotRecord, tasks: Vec<Task>) -> Self {
        let mut current_task = None;
        let mut task_history = Vec::new();
        for task in tasks {
            if !task.is_archived() && Some(&task.id) == record.current_task_id.as_ref() {
                current_task = Some(task);
            } else {
                task_history.push(task);
            }
        }
        task_history.sort_by_key(|task| task.created_at);

        Self {
            id: record.id,
            version: record.version,
            state: record.state,
            healthy: record.healthy,
            ip: record.ip,
            current_task,
            task_history,
            reservation: record.reservation,
            restart_policy: RestartPolicy::restore(
                record.restart,
                record.restart_retries,
                record.restart_stopped,
            ),
            created_at: record.created_at,
            updated_at: record.updated_at,
            tx_depth: 0,
        }
    }

    pub fn record(&self) -> SlotRecord {
        SlotRecord {
            id: self.id.clone(),
            version: self.version.clone(),
            state: self.state,
            healthy: self.healthy,
            ip: self.ip,
            current_task_id: self.current_task.as_ref().map(|t| t.id.clone()),
            reservation: self.reservation.clone(),
            restart: self.restart_policy.config().clone(),
            restart_retries: self.restart_policy.retries(),
            restart_stopped: !self.restart_policy.is_armed(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &SlotId {
        &self.id
    }

    pub fn index(&self) -> u32 {
        self.id.index()
    }

    pub fn app_id(&self) -> &AppId {
        self.id.app_id()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current_task.as_ref()
    }

    pub fn task_history(&self) -> &[Task] {
        &self.task_history
    }

    pub fn reservation(&self) -> Option<&OfferInfo> {
        self.reservation.as_ref()
    }

    pub fn restart_policy(&self) -> &RestartPolicy {
        &self.restart_policy
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn abnormal(&self) -> bool {
        self.state.is_abnormal()
    }

    pub fn dispatched(&self) -> bool {
        self.state.is_dispatched()
    }

    /// Running and healthy.
    pub fn is_ready(&self) -> bool {
        self.state == SlotState::Running && self.healthy
    }

    /// DNS name of the instance within its cluster domain.
    pub fn service_discovery_name(&self) -> String {
        format!("{}.{}", self.index(), self.app_id()).to_lowercase()
    }

    /// Scalar resources one task of this slot asks for.
    pub fn resources_needed(&self) -> Vec<Resource> {
        resources_needed(&self.version)
    }

    /// Resources held on an agent right now.
    pub fn resources_used(&self) -> ResourceClaim {
        if !self.state.holds_resources() {
            return ResourceClaim::default();
        }
        ResourceClaim {
            cpus: self.version.cpus,
            mem: self.version.mem,
            disk: self.version.disk,
            ports: self
                .current_task
                .as_ref()
                .map(|t| t.host_ports.len())
                .unwrap_or(0),
        }
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Opens a write batch. Slot writes are deferred until the outermost
    /// guard drops, which flushes exactly once.
    pub fn begin_tx<'t>(&'t mut self, store: &'t StateStore) -> SlotTx<'t> {
        self.tx_depth += 1;
        SlotTx { slot: self, store }
    }

    pub fn in_tx(&self) -> bool {
        self.tx_depth > 0
    }

    fn touch(&mut self, store: &StateStore) {
        self.updated_at = Utc::now();
        if self.tx_depth == 0 {
            self.persist(store);
        }
    }

    fn persist(&self, store: &StateStore) {
        if let Err(e) = store.update_slot(&self.record()) {
            warn!(slot_id = %self.id, error = %e, "Failed to persist slot");
        }
    }

    fn persist_task(store: &StateStore, task: &Task) {
        if let Err(e) = store.update_task(task) {
            warn!(task_id = %task.id, error = %e, "Failed to persist task");
        }
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Describes the slot for lifecycle listeners.
    pub fn task_info_event(&self, app: &AppMeta) -> TaskInfoEvent {
        let endpoint = match app.mode {
            berth_events::AppMode::Fixed => Endpoint::Fixed { ip: self.ip },
            berth_events::AppMode::Replicated => Endpoint::Replicated {
                host: self
                    .current_task
                    .as_ref()
                    .and_then(|t| t.hostname.clone()),
                port: self
                    .current_task
                    .as_ref()
                    .and_then(|t| t.host_ports.first().copied()),
                port_name: self
                    .version
                    .container
                    .port_mappings
                    .first()
                    .map(|m| m.name.clone()),
            },
        };

        TaskInfoEvent {
            slot_id: self.id.clone(),
            task_id: self.current_task.as_ref().map(|t| t.id.clone()),
            app_id: self.id.app_id().clone(),
            state: self.state,
            healthy: self.healthy,
            cluster_id: app.cluster_id.clone(),
            run_as: self.version.run_as.clone(),
            endpoint,
        }
    }

    fn emit(&self, event_type: TaskEventType, env: &SlotEnv<'_>) {
        env.events.publish(event_type, self.task_info_event(env.app));
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Records `state`, emits its lifecycle event and, outside the pending
    /// states, asks the app to step.
    pub fn set_state(&mut self, state: SlotState, env: &mut SlotEnv<'_>) {
        let previous = self.state;
        self.state = state;
        debug!(
            slot_id = %self.id,
            from = %previous,
            to = %state,
            "Slot state changed"
        );

        self.emit(state.event_type(), env);

        match state {
            SlotState::Running if self.version.health_check.is_none() => {
                self.set_healthy(true, env);
            }
            SlotState::Finished if !self.version.restart_on_finished => {
                self.stop_restart_policy();
            }
            SlotState::Killed => {
                self.stop_restart_policy();
            }
            _ => {}
        }

        if state.is_terminal() {
            self.release_reservation(env);
        }

        if !state.is_pending() {
            env.request_step();
        }
        self.touch(env.store);
    }

    pub fn set_healthy(&mut self, healthy: bool, env: &mut SlotEnv<'_>) {
        self.healthy = healthy;
        debug!(slot_id = %self.id, healthy, "Slot health changed");
        self.emit(TaskEventType::for_health(healthy), env);
        env.request_step();
        self.touch(env.store);
    }

    pub fn stop_restart_policy(&mut self) {
        if self.restart_policy.stop() {
            debug!(slot_id = %self.id, "Restart policy stopped");
        }
    }

    fn release_reservation(&mut self, env: &mut SlotEnv<'_>) {
        self.reservation = None;
        if env.allocator.release(&self.id).is_some() {
            if let Err(e) = env.store.delete_reservation(&self.id) {
                warn!(slot_id = %self.id, error = %e, "Failed to delete reservation");
            }
        }
    }

    /// Stops the slot for good. The restart policy is disarmed before any
    /// state changes so no later status update can bring the slot back.
    pub fn kill_task(&mut self, env: &mut SlotEnv<'_>) {
        let mut tx = self.begin_tx(env.store);
        tx.stop_restart_policy();
        env.allocator.remove_from_pending_queue(&tx.id);

        let state = tx.state;
        match state {
            SlotState::PendingKill => {
                if let Some(task) = &tx.current_task {
                    task.kill(env.commands);
                }
            }
            state if state.is_dispatched() => {
                tx.set_state(SlotState::PendingKill, env);
                if let Some(task) = &tx.current_task {
                    task.kill(env.commands);
                }
            }
            _ => tx.set_state(SlotState::Reap, env),
        }
    }

    /// Moves the current task into history.
    pub fn archive(&mut self, env: &mut SlotEnv<'_>) {
        let mut tx = self.begin_tx(env.store);
        let state = tx.state;
        if let Some(mut task) = tx.current_task.take() {
            task.archive(state);
            Self::persist_task(env.store, &task);
            tx.task_history.push(task);
            tx.touch(env.store);
        }
    }

    /// Starts a fresh attempt with `version` and queues it for placement.
    pub fn dispatch_new_task(&mut self, version: Version, env: &mut SlotEnv<'_>) {
        let mut tx = self.begin_tx(env.store);
        if tx.current_task.is_some() {
            tx.archive(env);
        }

        tx.version = version;
        tx.healthy = false;
        tx.release_reservation(env);

        let task = Task::new(tx.id.clone(), tx.version.id);
        if let Err(e) = env.store.create_task(&task) {
            warn!(task_id = %task.id, error = %e, "Failed to persist task");
        }
        debug!(slot_id = %tx.id, task_id = %task.id, "Dispatching new task");
        tx.current_task = Some(task);

        tx.set_state(SlotState::PendingOffer, env);
        env.allocator.put_slot_back_to_pending_queue(tx.id.clone());
    }

    /// Returns a staged slot to the queue when its launch for `task_id` never
    /// reached the connector. The restart budget is not charged.
    pub fn abandon_launch(&mut self, task_id: &TaskId, env: &mut SlotEnv<'_>) -> bool {
        let staged = self.state == SlotState::Staging
            && self.current_task.as_ref().is_some_and(|t| &t.id == task_id);
        if !staged {
            return false;
        }
        warn!(slot_id = %self.id, task_id = %task_id, "Launch not sent; requeueing slot");
        let version = self.version.clone();
        self.dispatch_new_task(version, env);
        true
    }

    /// Replaces the running task with one on `version`.
    pub fn redeploy(&mut self, version: Version, env: &mut SlotEnv<'_>) {
        let mut tx = self.begin_tx(env.store);
        if tx.state.holds_resources() {
            if let Some(task) = &tx.current_task {
                task.kill(env.commands);
            }
        }
        info!(slot_id = %tx.id, version_id = %version.id, "Redeploying slot");
        tx.dispatch_new_task(version, env);
    }

    /// Restarts an abnormal slot if its policy is due.
    pub fn test_and_restart(&mut self, now: Instant, env: &mut SlotEnv<'_>) -> bool {
        if !self.abnormal() || !self.restart_policy.due(now) {
            return false;
        }

        if self.restart_policy.exhausted() {
            self.stop_restart_policy();
            warn!(
                slot_id = %self.id,
                state = %self.state,
                retries = self.restart_policy.retries(),
                "Restart budget exhausted; slot stays stopped"
            );
            self.touch(env.store);
            return false;
        }

        info!(
            slot_id = %self.id,
            state = %self.state,
            retries = self.restart_policy.retries(),
            "Restarting slot"
        );
        let mut tx = self.begin_tx(env.store);
        let version = tx.version.clone();
        tx.dispatch_new_task(version, env);
        tx.restart_policy.record_restart(now);
        true
    }

    /// Records the resource manager's last message on the current task.
    pub fn note_task_message(&mut self, message: String, env: &mut SlotEnv<'_>) {
        if let Some(task) = self.current_task.as_mut() {
            if task.message.as_deref() != Some(message.as_str()) {
                task.message = Some(message);
                Self::persist_task(env.store, task);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Whether the slot's constraints and resource needs fit `ow`.
    /// Malformed constraints never match.
    pub fn test_offer_match(&self, ow: &OfferWrapper, env: &SlotEnv<'_>) -> bool {
        if let Some(expr) = &self.version.constraints {
            match env.constraints.matches(expr, &self.id, ow.offer()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(slot_id = %self.id, offer_id = %ow.offer().id, "Constraints not met");
                    return false;
                }
                Err(e) => {
                    warn!(
                        slot_id = %self.id,
                        constraints = %expr,
                        error = %e,
                        "Malformed constraint; treating as non-match"
                    );
                    return false;
                }
            }
        }

        match ow.shortfall(&self.version.claim(env.app.mode)) {
            None => true,
            Some(e) => {
                debug!(slot_id = %self.id, offer_id = %ow.offer().id, reason = %e, "Offer does not fit");
                false
            }
        }
    }

    /// Claims capacity on `ow`, builds the launch descriptor and records the
    /// placement on the slot and its task.
    pub fn reserve_offer_and_prepare_task_info(
        &mut self,
        ow: &mut OfferWrapper,
        env: &mut SlotEnv<'_>,
    ) -> Result<TaskInfo, AllocError> {
        if self.state != SlotState::PendingOffer || self.reservation.is_some() {
            return Err(AllocError::NotPending(self.id.to_string()));
        }
        if self.current_task.is_none() {
            return Err(AllocError::NoTask(self.id.to_string()));
        }

        let claim = self.version.claim(env.app.mode);
        let host_ports = ow.reserve(&claim)?;

        let mut tx = self.begin_tx(env.store);
        let slot: &mut Slot = &mut tx;
        let offer_info = OfferInfo::new(ow.offer(), &claim);

        let Some(task) = slot.current_task.as_mut() else {
            return Err(AllocError::NoTask(slot.id.to_string()));
        };
        let task_info = task.prepare_task_info(
            &slot.version,
            ow.offer(),
            &LaunchContext {
                mode: env.app.mode,
                cluster_id: &env.app.cluster_id,
                ip: slot.ip,
                host_ports: &host_ports,
            },
        );
        task.set_offer_info(ow.offer(), host_ports);
        Self::persist_task(env.store, task);

        slot.reservation = Some(offer_info.clone());
        if let Err(e) = env.store.put_reservation(&slot.id, &offer_info) {
            warn!(slot_id = %slot.id, error = %e, "Failed to persist reservation");
        }
        env.allocator.record_reservation(slot.id.clone(), offer_info);
        env.allocator.remove_from_pending_queue(&slot.id);

        debug!(
            slot_id = %slot.id,
            offer_id = %ow.offer().id,
            cpus_used = ow.cpus_used(),
            mem_used = ow.mem_used(),
            "Reserved offer"
        );
        slot.touch(env.store);
        Ok(task_info)
    }

    /// Tears the slot down: disarms restarts, drops it from the allocator and
    /// deletes it with its task history.
    pub fn remove(&mut self, env: &mut SlotEnv<'_>) {
        self.stop_restart_policy();
        env.allocator.forget(&self.id);
        if let Err(e) = env.store.delete_reservation(&self.id) {
            warn!(slot_id = %self.id, error = %e, "Failed to delete reservation");
        }
        if let Err(e) = env.store.delete_slot(&self.id) {
            warn!(slot_id = %self.id, error = %e, "Failed to delete slot");
        }
        info!(slot_id = %self.id, state = %self.state, "Slot removed");
    }
}

// =============================================================================
// Transaction Guard
// =============================================================================

/// Scoped write batch returned by [`Slot::begin_tx`].
///
/// Dereferences to the slot. Dropping the outermost guard (including on an
/// early return) persists the slot once.
pub struct SlotTx<'t> {
    slot: &'t mut Slot,
    store: &'t StateStore,
}

impl SlotTx<'_> {
    /// Ends the batch. Equivalent to dropping the guard.
    pub fn commit(self) {}
}

impl Deref for SlotTx<'_> {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        self.slot
    }
}

impl DerefMut for SlotTx<'_> {
    fn deref_mut(&mut self) -> &mut Slot {
        self.slot
    }
}

impl Drop for SlotTx<'_> {
    fn drop(&mut self) {
        self.slot.tx_depth = self.slot.tx_depth.saturating_sub(1);
        if self.slot.tx_depth == 0 {
            self.slot.persist(self.store);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Command;
    use crate::state::testing::{offer, Harness};
    use crate::state::version::fixtures::version;
    use berth_events::AppMode;
    use std::time::Duration;

    fn new_slot(h: &mut Harness, index: u32) -> Slot {
        let id = SlotId::new(h.meta.app_id.clone(), index);
        let mut slot = Slot::new(id, version(), None, RestartPolicyConfig::default());
        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        slot.dispatch_new_task(version(), &mut env);
        slot
    }

    fn set_state(h: &mut Harness, slot: &mut Slot, state: SlotState) -> bool {
        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        slot.set_state(state, &mut env);
        env.step_requested()
    }

    fn place(h: &mut Harness, slot: &mut Slot) -> TaskInfo {
        let mut ow = OfferWrapper::new(offer(4.0, 4096.0, vec![(31000, 31010)]));
        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        assert!(slot.test_offer_match(&ow, &env));
        let info = slot
            .reserve_offer_and_prepare_task_info(&mut ow, &mut env)
            .unwrap();
        slot.set_state(SlotState::Staging, &mut env);
        info
    }

    #[test]
    fn test_dispatch_queues_slot() {
        let mut h = Harness::new(AppMode::Replicated);
        let slot = new_slot(&mut h, 0);

        assert_eq!(slot.state(), SlotState::PendingOffer);
        assert!(slot.current_task().is_some());
        assert!(h.allocator.is_pending(slot.id()));
        assert_eq!(h.drain_events()[0].event_type, SlotState::PendingOffer.event_type());
    }

    #[test]
    fn test_pending_states_do_not_step() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        assert!(!set_state(&mut h, &mut slot, SlotState::PendingKill));
        assert!(set_state(&mut h, &mut slot, SlotState::Starting));
    }

    #[test]
    fn test_running_without_health_check_is_healthy() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        place(&mut h, &mut slot);
        h.drain_events();

        set_state(&mut h, &mut slot, SlotState::Running);
        assert!(slot.healthy());
        assert!(slot.is_ready());

        let types: Vec<_> = h.drain_events().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![SlotState::Running.event_type(), TaskEventType::Healthy]
        );
    }

    #[test]
    fn test_finished_stops_restart_policy() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        place(&mut h, &mut slot);

        assert!(set_state(&mut h, &mut slot, SlotState::Finished));
        assert!(!slot.restart_policy().is_armed());
        assert!(slot.reservation().is_none());
        assert!(h.allocator.reservation(slot.id()).is_none());
    }

    #[test]
    fn test_finished_can_restart_when_configured() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        slot.version.restart_on_finished = true;
        place(&mut h, &mut slot);

        set_state(&mut h, &mut slot, SlotState::Finished);
        assert!(slot.restart_policy().is_armed());
    }

    #[test]
    fn test_reserve_records_placement() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        let info = place(&mut h, &mut slot);

        let task = slot.current_task().unwrap();
        assert_eq!(info.task_id, task.id);
        assert_eq!(task.agent_id.as_ref().unwrap().as_str(), "agent-1");
        assert_eq!(task.hostname.as_deref(), Some("host-1"));
        assert_eq!(task.host_ports, vec![31000]);
        assert_eq!(slot.reservation().unwrap().offer_id.as_str(), "offer-1");
        assert!(!h.allocator.is_pending(slot.id()));
        assert!(h.allocator.reservation(slot.id()).is_some());
        assert_eq!(slot.resources_used().cpus, 1.0);
    }

    #[test]
    fn test_reserve_twice_is_rejected() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        let mut ow = OfferWrapper::new(offer(4.0, 4096.0, vec![(31000, 31010)]));
        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);

        slot.reserve_offer_and_prepare_task_info(&mut ow, &mut env)
            .unwrap();
        let err = slot
            .reserve_offer_and_prepare_task_info(&mut ow, &mut env)
            .unwrap_err();
        assert!(matches!(err, AllocError::NotPending(_)));
        assert_eq!(ow.cpus_used(), 1.0);
    }

    #[test]
    fn test_ports_mismatch_in_replicated_mode() {
        let mut h = Harness::new(AppMode::Replicated);
        let slot = new_slot(&mut h, 0);
        let ow = OfferWrapper::new(offer(4.0, 4096.0, vec![]));
        let (mut svc, meta) = h.parts();
        let env = SlotEnv::new(&mut svc, meta);
        assert!(!slot.test_offer_match(&ow, &env));
    }

    #[test]
    fn test_fixed_mode_ignores_ports() {
        let mut h = Harness::new(AppMode::Fixed);
        let slot = new_slot(&mut h, 0);
        let ow = OfferWrapper::new(offer(4.0, 4096.0, vec![]));
        let (mut svc, meta) = h.parts();
        let env = SlotEnv::new(&mut svc, meta);
        assert!(slot.test_offer_match(&ow, &env));
    }

    #[test]
    fn test_malformed_constraint_fails_closed() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        slot.version.constraints = Some("hostname".to_string());
        let ow = OfferWrapper::new(offer(4.0, 4096.0, vec![(31000, 31010)]));
        let (mut svc, meta) = h.parts();
        let env = SlotEnv::new(&mut svc, meta);
        assert!(!slot.test_offer_match(&ow, &env));
    }

    #[test]
    fn test_kill_dispatched_slot() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        place(&mut h, &mut slot);
        set_state(&mut h, &mut slot, SlotState::Running);

        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        slot.kill_task(&mut env);

        assert_eq!(slot.state(), SlotState::PendingKill);
        assert!(!slot.restart_policy().is_armed());
        assert!(matches!(h.commands_rx.try_recv().unwrap(), Command::Kill { .. }));
    }

    #[test]
    fn test_kill_undispatched_slot_reaps() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);

        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        slot.kill_task(&mut env);

        assert_eq!(slot.state(), SlotState::Reap);
        assert!(!h.allocator.is_pending(slot.id()));
        assert!(h.commands_rx.try_recv().is_err());
    }

    #[test]
    fn test_abnormal_exit_restarts_immediately() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        place(&mut h, &mut slot);
        set_state(&mut h, &mut slot, SlotState::Running);
        set_state(&mut h, &mut slot, SlotState::Failed);
        let first = slot.current_task().unwrap().id.clone();

        let now = Instant::now();
        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        assert!(slot.test_and_restart(now, &mut env));

        assert_eq!(slot.state(), SlotState::PendingOffer);
        assert_eq!(slot.task_history().len(), 1);
        assert_eq!(slot.task_history()[0].id, first);
        assert_eq!(slot.task_history()[0].final_state, Some(SlotState::Failed));
        assert_ne!(slot.current_task().unwrap().id, first);
        assert!(!slot.healthy());
        assert!(h.allocator.is_pending(slot.id()));
    }

    #[test]
    fn test_restart_waits_for_backoff() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        let t0 = Instant::now();

        set_state(&mut h, &mut slot, SlotState::Lost);
        {
            let (mut svc, meta) = h.parts();
            let mut env = SlotEnv::new(&mut svc, meta);
            assert!(slot.test_and_restart(t0, &mut env));
        }

        set_state(&mut h, &mut slot, SlotState::Lost);
        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        assert!(!slot.test_and_restart(t0 + Duration::from_secs(5), &mut env));
        assert!(slot.test_and_restart(t0 + Duration::from_secs(10), &mut env));
    }

    #[test]
    fn test_exhausted_budget_stops_policy() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        slot.restart_policy = RestartPolicy::new(RestartPolicyConfig {
            max_retries: Some(0),
            ..RestartPolicyConfig::default()
        });
        set_state(&mut h, &mut slot, SlotState::Failed);

        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        assert!(!slot.test_and_restart(Instant::now(), &mut env));
        assert!(!slot.restart_policy().is_armed());
        assert_eq!(slot.state(), SlotState::Failed);
    }

    #[test]
    fn test_killed_slot_never_restarts() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        place(&mut h, &mut slot);
        {
            let (mut svc, meta) = h.parts();
            let mut env = SlotEnv::new(&mut svc, meta);
            slot.kill_task(&mut env);
        }
        set_state(&mut h, &mut slot, SlotState::Failed);

        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        assert!(!slot.test_and_restart(Instant::now(), &mut env));
        assert_eq!(slot.state(), SlotState::Failed);
    }

    #[test]
    fn test_transaction_flushes_once() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        set_state(&mut h, &mut slot, SlotState::Failed);
        let before = h.slot_writes();

        let (mut svc, meta) = h.parts();
        let mut env = SlotEnv::new(&mut svc, meta);
        {
            let mut tx = slot.begin_tx(env.store);
            tx.archive(&mut env);
            let v = tx.version().clone();
            tx.dispatch_new_task(v, &mut env);
            assert!(tx.in_tx());
            tx.commit();
        }
        assert!(!slot.in_tx());
        assert_eq!(h.slot_writes() - before, 1);
    }

    #[test]
    fn test_event_payload_replicated() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        place(&mut h, &mut slot);

        let event = slot.task_info_event(&h.meta);
        assert_eq!(
            event.endpoint,
            Endpoint::Replicated {
                host: Some("host-1".to_string()),
                port: Some(31000),
                port_name: Some("http".to_string()),
            }
        );
        assert_eq!(event.cluster_id, "dc1");
        assert_eq!(event.run_as, "ops");
        assert_eq!(slot.service_discovery_name(), "0.web");
    }

    #[test]
    fn test_record_roundtrip() {
        let mut h = Harness::new(AppMode::Replicated);
        let mut slot = new_slot(&mut h, 0);
        place(&mut h, &mut slot);
        set_state(&mut h, &mut slot, SlotState::Failed);
        {
            let (mut svc, meta) = h.parts();
            let mut env = SlotEnv::new(&mut svc, meta);
            slot.test_and_restart(Instant::now(), &mut env);
        }

        let mut tasks: Vec<Task> = slot.task_history().to_vec();
        tasks.extend(slot.current_task().cloned());
        let restored = Slot::from_record(slot.record(), tasks);

        assert_eq!(restored.state(), SlotState::PendingOffer);
        assert_eq!(restored.current_task(), slot.current_task());
        assert_eq!(restored.task_history().len(), 1);
        assert_eq!(restored.restart_policy().retries(), 1);
    }
}
