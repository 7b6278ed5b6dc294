//! App aggregate.
//!
//! An app owns its slots by index and rolls their states up into an
//! [`AppStatus`]. `step()` runs once after every slot operation that
//! requested it and is the only place status transitions happen outside
//! the user operations.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use berth_events::{AppMode, LifecycleEvent, TaskEventType};
use berth_id::{AppId, SlotId, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::slot::Slot;
use super::version::{AppSpec, Version};
use super::{AppMeta, RestartPolicyConfig, Services, SlotEnv};
use crate::error::{SchedulerError, SchedulerResult};

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AppStatus {
    /// Slots dispatched, not all running and healthy yet.
    Creating,
    /// Every slot running and healthy.
    Normal,
    /// At least one slot is not running or not healthy.
    Degraded,
    ScalingUp { target: u32 },
    ScalingDown { target: u32 },
    Updating { version_id: VersionId },
    Deleting,
}

impl AppStatus {
    /// Busy apps reject scale, update and a second delete.
    pub fn is_busy(&self) -> bool {
        !matches!(self, AppStatus::Normal | AppStatus::Degraded)
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Creating => f.write_str("creating"),
            AppStatus::Normal => f.write_str("normal"),
            AppStatus::Degraded => f.write_str("degraded"),
            AppStatus::ScalingUp { target } => write!(f, "scaling_up({target})"),
            AppStatus::ScalingDown { target } => write!(f, "scaling_down({target})"),
            AppStatus::Updating { version_id } => write!(f, "updating({version_id})"),
            AppStatus::Deleting => f.write_str("deleting"),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Persisted form of an app. Slots are stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: AppId,
    pub mode: AppMode,
    pub cluster_id: String,
    pub current_version: Version,
    pub proposed_version: Option<Version>,
    #[serde(default)]
    pub versions: Vec<Version>,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only view returned to user queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSummary {
    pub app_id: AppId,
    pub mode: AppMode,
    pub status: AppStatus,
    pub instances: u32,
    pub healthy: u32,
    pub running: u32,
    pub version_id: VersionId,
    pub proposed_version_id: Option<VersionId>,
    pub cpus_used: f64,
    pub mem_used: f64,
    pub disk_used: f64,
    /// Slot count per state name.
    pub states: BTreeMap<String, u32>,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// App
// =============================================================================

#[derive(Debug)]
pub struct App {
    meta: AppMeta,
    current_version: Version,
    proposed_version: Option<Version>,
    versions: Vec<Version>,
    slots: BTreeMap<u32, Slot>,
    status: AppStatus,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl App {
    /// Validates `spec`, persists the app and dispatches its slots.
    pub fn create(spec: AppSpec, cluster_id: &str, svc: &mut Services<'_>) -> SchedulerResult<Self> {
        spec.version.validate(spec.mode)?;

        let now = Utc::now();
        let mut app = Self {
            meta: AppMeta {
                app_id: spec.id,
                mode: spec.mode,
                cluster_id: cluster_id.to_string(),
            },
            current_version: spec.version.clone(),
            proposed_version: None,
            versions: vec![spec.version],
            slots: BTreeMap::new(),
            status: AppStatus::Creating,
            revision: 0,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = svc.store.create_app(&app.record()) {
            warn!(app_id = %app.meta.app_id, error = %e, "Failed to persist app");
        }

        for index in 0..app.current_version.instances {
            app.create_slot(index, svc);
        }
        info!(
            app_id = %app.meta.app_id,
            mode = %app.meta.mode,
            instances = app.current_version.instances,
            version_id = %app.current_version.id,
            "App created"
        );

        app.step(svc);
        Ok(app)
    }

    /// Rebuilds an app from persisted state.
    pub fn from_record(record: AppRecord, slots: Vec<Slot>) -> Self {
        Self {
            meta: AppMeta {
                app_id: record.id,
                mode: record.mode,
                cluster_id: record.cluster_id,
            },
            current_version: record.current_version,
            proposed_version: record.proposed_version,
            versions: record.versions,
            slots: slots.into_iter().map(|s| (s.index(), s)).collect(),
            status: record.status,
            revision: 0,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    pub fn record(&self) -> AppRecord {
        AppRecord {
            id: self.meta.app_id.clone(),
            mode: self.meta.mode,
            cluster_id: self.meta.cluster_id.clone(),
            current_version: self.current_version.clone(),
            proposed_version: self.proposed_version.clone(),
            versions: self.versions.clone(),
            status: self.status.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &AppId {
        &self.meta.app_id
    }

    pub fn meta(&self) -> &AppMeta {
        &self.meta
    }

    pub fn mode(&self) -> AppMode {
        self.meta.mode
    }

    pub fn status(&self) -> &AppStatus {
        &self.status
    }

    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    pub fn proposed_version(&self) -> Option<&Version> {
        self.proposed_version.as_ref()
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Number of `step()` runs since load.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(&index)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // -------------------------------------------------------------------------
    // Slot access
    // -------------------------------------------------------------------------

    /// Runs `f` against one slot and steps the app afterwards if the slot
    /// asked for it. Returns `None` for an unknown index.
    pub fn with_slot<R>(
        &mut self,
        index: u32,
        svc: &mut Services<'_>,
        f: impl FnOnce(&mut Slot, &mut SlotEnv<'_>) -> R,
    ) -> Option<R> {
        let (result, step) = self.with_slot_no_step(index, svc, f)?;
        if step {
            self.step(svc);
        }
        Some(result)
    }

    /// Like [`App::with_slot`] but leaves stepping to the caller. Returns
    /// whether a step was requested.
    fn with_slot_no_step<R>(
        &mut self,
        index: u32,
        svc: &mut Services<'_>,
        f: impl FnOnce(&mut Slot, &mut SlotEnv<'_>) -> R,
    ) -> Option<(R, bool)> {
        let slot = self.slots.get_mut(&index)?;
        let mut env = SlotEnv::new(svc, &self.meta);
        let result = f(slot, &mut env);
        Some((result, env.step_requested()))
    }

    fn create_slot(&mut self, index: u32, svc: &mut Services<'_>) {
        let version = self.current_version.clone();
        let restart = self.restart_config(svc.restart_defaults);
        let ip = match self.meta.mode {
            AppMode::Fixed => version.ip_for(index),
            AppMode::Replicated => None,
        };

        let mut slot = Slot::new(
            SlotId::new(self.meta.app_id.clone(), index),
            version.clone(),
            ip,
            restart,
        );
        if let Err(e) = svc.store.create_slot(&slot.record()) {
            warn!(slot_id = %slot.id(), error = %e, "Failed to persist slot");
        }

        let mut env = SlotEnv::new(svc, &self.meta);
        slot.dispatch_new_task(version, &mut env);
        self.slots.insert(index, slot);
    }

    // -------------------------------------------------------------------------
    // Step
    // -------------------------------------------------------------------------

    /// Re-evaluates the status from slot states.
    pub fn step(&mut self, svc: &mut Services<'_>) {
        self.revision += 1;
        debug!(app_id = %self.meta.app_id, revision = self.revision, status = %self.status, "Stepping app");

        match self.status.clone() {
            AppStatus::Creating | AppStatus::ScalingUp { .. } => {
                if self.all_ready() {
                    self.set_status(AppStatus::Normal, svc);
                }
            }
            AppStatus::ScalingDown { target } => {
                self.reap_scaled_down(target, svc);
                if self.slots.keys().all(|index| *index < target) {
                    self.set_status(self.settled_status(), svc);
                }
            }
            AppStatus::Updating { .. } => self.advance_update(svc),
            AppStatus::Normal | AppStatus::Degraded => {
                self.set_status(self.settled_status(), svc);
            }
            AppStatus::Deleting => {}
        }
    }

    fn all_ready(&self) -> bool {
        self.slots.values().all(Slot::is_ready)
    }

    fn settled_status(&self) -> AppStatus {
        if self.all_ready() {
            AppStatus::Normal
        } else {
            AppStatus::Degraded
        }
    }

    fn set_status(&mut self, status: AppStatus, svc: &mut Services<'_>) {
        if self.status == status {
            return;
        }
        info!(app_id = %self.meta.app_id, from = %self.status, to = %status, "App status changed");
        self.status = status;
        self.persist(svc);
    }

    fn persist(&mut self, svc: &Services<'_>) {
        self.updated_at = Utc::now();
        if let Err(e) = svc.store.update_app(&self.record()) {
            warn!(app_id = %self.meta.app_id, error = %e, "Failed to persist app");
        }
    }

    /// Removes slots at or above `target` once they stopped.
    fn reap_scaled_down(&mut self, target: u32, svc: &mut Services<'_>) {
        let done: Vec<u32> = self
            .slots
            .range(target..)
            .filter(|(_, slot)| slot.state().is_terminal())
            .map(|(index, _)| *index)
            .collect();

        for index in done {
            if let Some(mut slot) = self.slots.remove(&index) {
                let mut env = SlotEnv::new(svc, &self.meta);
                slot.remove(&mut env);
            }
        }
    }

    /// Moves a rolling update forward by at most one slot.
    fn advance_update(&mut self, svc: &mut Services<'_>) {
        let Some(target) = self.proposed_version.clone() else {
            self.set_status(self.settled_status(), svc);
            return;
        };

        let waiting = self
            .slots
            .values()
            .any(|slot| slot.version().id == target.id && !slot.is_ready());
        if waiting {
            return;
        }

        let next = self
            .slots
            .values()
            .find(|slot| slot.version().id != target.id)
            .map(Slot::index);

        match next {
            Some(index) => {
                let version = target.clone();
                self.with_slot_no_step(index, svc, |slot, env| slot.redeploy(version, env));
            }
            None => {
                info!(app_id = %self.meta.app_id, version_id = %target.id, "Update complete");
                self.proposed_version = None;
                self.current_version = target;
                let status = self.settled_status();
                self.status = status;
                self.persist(svc);
            }
        }
    }

    // -------------------------------------------------------------------------
    // User operations
    // -------------------------------------------------------------------------

    fn ensure_idle(&self) -> SchedulerResult<()> {
        if self.status.is_busy() {
            return Err(SchedulerError::AppBusy {
                app_id: self.meta.app_id.clone(),
                status: self.status.clone(),
            });
        }
        Ok(())
    }

    /// Changes the instance count. Fixed-mode apps append `extra_ips` to the
    /// pool before growing.
    pub fn scale(
        &mut self,
        instances: u32,
        extra_ips: Vec<IpAddr>,
        svc: &mut Services<'_>,
    ) -> SchedulerResult<()> {
        self.ensure_idle()?;

        let current = self.slots.len() as u32;
        if instances == current && extra_ips.is_empty() {
            return Ok(());
        }

        let mut version = self.current_version.clone();
        version.ips.extend(extra_ips);
        version.instances = instances;
        version.validate(self.meta.mode)?;
        self.current_version = version;

        info!(app_id = %self.meta.app_id, from = current, to = instances, "Scaling app");

        if instances > current {
            self.status = AppStatus::ScalingUp { target: instances };
            for index in current..instances {
                self.create_slot(index, svc);
            }
        } else if instances < current {
            self.status = AppStatus::ScalingDown { target: instances };
            let doomed: Vec<u32> = self.slots.range(instances..).map(|(i, _)| *i).collect();
            for index in doomed {
                self.with_slot_no_step(index, svc, |slot, env| slot.kill_task(env));
            }
        }

        self.persist(svc);
        self.step(svc);
        Ok(())
    }

    /// Starts a rolling update to `version`.
    pub fn update(&mut self, mut version: Version, svc: &mut Services<'_>) -> SchedulerResult<()> {
        self.ensure_idle()?;

        version.instances = self.slots.len() as u32;
        version.validate(self.meta.mode)?;
        if version.id == self.current_version.id {
            return Err(SchedulerError::VersionUnchanged(version.id));
        }

        info!(
            app_id = %self.meta.app_id,
            from = %self.current_version.id,
            to = %version.id,
            "Starting rolling update"
        );
        self.status = AppStatus::Updating {
            version_id: version.id,
        };
        self.versions.push(version.clone());
        self.proposed_version = Some(version);
        self.persist(svc);
        self.step(svc);
        Ok(())
    }

    /// Rolls an in-flight update back to the current version.
    pub fn cancel_update(&mut self, svc: &mut Services<'_>) -> SchedulerResult<()> {
        let AppStatus::Updating { version_id } = &self.status else {
            return Err(SchedulerError::NoUpdateInProgress(self.meta.app_id.clone()));
        };
        if *version_id == self.current_version.id {
            // Already rolling back.
            return Ok(());
        }

        info!(
            app_id = %self.meta.app_id,
            abandoned = %version_id,
            version_id = %self.current_version.id,
            "Cancelling update"
        );
        self.status = AppStatus::Updating {
            version_id: self.current_version.id,
        };
        self.proposed_version = Some(self.current_version.clone());
        self.persist(svc);
        self.step(svc);
        Ok(())
    }

    /// Marks the app for deletion and kills every slot.
    pub fn delete(&mut self, svc: &mut Services<'_>) -> SchedulerResult<()> {
        if self.status == AppStatus::Deleting {
            return Err(SchedulerError::AppBusy {
                app_id: self.meta.app_id.clone(),
                status: self.status.clone(),
            });
        }

        info!(app_id = %self.meta.app_id, slots = self.slots.len(), "Deleting app");
        self.status = AppStatus::Deleting;
        self.persist(svc);

        let indexes: Vec<u32> = self.slots.keys().copied().collect();
        for index in indexes {
            self.with_slot_no_step(index, svc, |slot, env| slot.kill_task(env));
        }
        Ok(())
    }

    /// True once a deleting app has no live slot left.
    pub fn can_be_clean_after_deletion(&self) -> bool {
        self.status == AppStatus::Deleting
            && self.slots.values().all(|slot| slot.state().is_terminal())
    }

    /// Deletes every slot and the app itself from the store.
    pub fn remove(mut self, svc: &mut Services<'_>) {
        let slots = std::mem::take(&mut self.slots);
        for (_, mut slot) in slots {
            let mut env = SlotEnv::new(svc, &self.meta);
            slot.remove(&mut env);
        }
        if let Err(e) = svc.store.delete_app(&self.meta.app_id) {
            warn!(app_id = %self.meta.app_id, error = %e, "Failed to delete app");
        }
        info!(app_id = %self.meta.app_id, "App removed");
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// One `TaskHealthy` event per running, healthy slot.
    pub fn healthy_task_events(&self, svc: &Services<'_>) -> Vec<LifecycleEvent> {
        self.slots
            .values()
            .filter(|slot| slot.is_ready())
            .map(|slot| {
                svc.events
                    .stamp(TaskEventType::Healthy, slot.task_info_event(&self.meta))
            })
            .collect()
    }

    pub fn summary(&self) -> AppSummary {
        let mut states: BTreeMap<String, u32> = BTreeMap::new();
        let (mut cpus, mut mem, mut disk) = (0.0, 0.0, 0.0);
        let mut healthy = 0;
        let mut running = 0;
        for slot in self.slots.values() {
            *states.entry(slot.state().to_string()).or_default() += 1;
            let used = slot.resources_used();
            cpus += used.cpus;
            mem += used.mem;
            disk += used.disk;
            if slot.healthy() {
                healthy += 1;
            }
            if slot.state() == berth_events::SlotState::Running {
                running += 1;
            }
        }

        AppSummary {
            app_id: self.meta.app_id.clone(),
            mode: self.meta.mode,
            status: self.status.clone(),
            instances: self.slots.len() as u32,
            healthy,
            running,
            version_id: self.current_version.id,
            proposed_version_id: self.proposed_version.as_ref().map(|v| v.id),
            cpus_used: cpus,
            mem_used: mem,
            disk_used: disk,
            states,
            revision: self.revision,
            updated_at: self.updated_at,
        }
    }

    /// Restart configuration applied to new slots.
    pub fn restart_config(&self, defaults: &RestartPolicyConfig) -> RestartPolicyConfig {
        self.current_version
            .restart
            .clone()
            .unwrap_or_else(|| defaults.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
