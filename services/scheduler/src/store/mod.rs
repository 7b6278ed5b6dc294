//! Durable scheduler state.
//!
//! [`StateStore`] maps apps, slots, tasks, reservations and the framework id
//! onto a [`KvStore`] as JSON documents:
//!
//! ```text
//! /apps/{app}
//! /slots/{app}/{slot}
//! /tasks/{app}/{slot}/{task}
//! /reservations/{app}/{slot}
//! /framework/id
//! ```
//!
//! Writes happen after the in-memory change; callers log failures and move
//! on. Load failures are fatal at startup.

mod kv;
mod memory;
mod sqlite;

pub use kv::KvStore;
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use berth_id::{AppId, FrameworkId, SlotId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::state::{AppRecord, OfferInfo, SlotRecord, Task};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store lock poisoned")]
    Poisoned,
}

/// A persisted slot with every task it ever ran.
#[derive(Debug, Clone)]
pub struct SlotData {
    pub slot: SlotRecord,
    pub tasks: Vec<Task>,
}

/// A persisted app with its slots.
#[derive(Debug, Clone)]
pub struct AppData {
    pub app: AppRecord,
    pub slots: Vec<SlotData>,
}

fn app_key(app_id: &AppId) -> String {
    format!("/apps/{app_id}")
}

fn slot_key(slot_id: &SlotId) -> String {
    format!("/slots/{}/{slot_id}", slot_id.app_id())
}

fn task_key(task: &Task) -> String {
    let slot_id = task.slot_id();
    format!("/tasks/{}/{slot_id}/{}", slot_id.app_id(), task.id)
}

fn tasks_prefix(slot_id: &SlotId) -> String {
    format!("/tasks/{}/{slot_id}/", slot_id.app_id())
}

fn reservation_key(slot_id: &SlotId) -> String {
    format!("/reservations/{}/{slot_id}", slot_id.app_id())
}

const FRAMEWORK_ID_KEY: &str = "/framework/id";

pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    /// Opens (or creates) a SQLite-backed store.
    pub fn open_sqlite<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SqliteKv::open(path)?)))
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.kv.put(key, &json)
    }

    fn decode<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, StoreError> {
        serde_json::from_str(value).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.kv
            .scan_prefix(prefix)?
            .iter()
            .map(|(key, value)| Self::decode(key, value))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Apps
    // -------------------------------------------------------------------------

    pub fn create_app(&self, app: &AppRecord) -> Result<(), StoreError> {
        self.put_json(&app_key(&app.id), app)
    }

    pub fn update_app(&self, app: &AppRecord) -> Result<(), StoreError> {
        self.put_json(&app_key(&app.id), app)
    }

    /// Deletes an app and everything stored under it.
    pub fn delete_app(&self, app_id: &AppId) -> Result<(), StoreError> {
        self.kv.delete(&app_key(app_id))?;
        for prefix in ["slots", "tasks", "reservations"] {
            self.kv.delete_prefix(&format!("/{prefix}/{app_id}/"))?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Slots and tasks
    // -------------------------------------------------------------------------

    pub fn create_slot(&self, slot: &SlotRecord) -> Result<(), StoreError> {
        self.put_json(&slot_key(&slot.id), slot)
    }

    pub fn update_slot(&self, slot: &SlotRecord) -> Result<(), StoreError> {
        self.put_json(&slot_key(&slot.id), slot)
    }

    /// Deletes a slot with its task history.
    pub fn delete_slot(&self, slot_id: &SlotId) -> Result<(), StoreError> {
        self.kv.delete(&slot_key(slot_id))?;
        self.kv.delete_prefix(&tasks_prefix(slot_id))?;
        Ok(())
    }

    pub fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        self.put_json(&task_key(task), task)
    }

    pub fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        self.put_json(&task_key(task), task)
    }

    // -------------------------------------------------------------------------
    // Framework and reservations
    // -------------------------------------------------------------------------

    pub fn get_framework_id(&self) -> Result<Option<FrameworkId>, StoreError> {
        self.kv
            .get(FRAMEWORK_ID_KEY)?
            .map(|value| Self::decode(FRAMEWORK_ID_KEY, &value))
            .transpose()
    }

    pub fn put_framework_id(&self, framework_id: &FrameworkId) -> Result<(), StoreError> {
        self.put_json(FRAMEWORK_ID_KEY, framework_id)
    }

    pub fn put_reservation(&self, slot_id: &SlotId, info: &OfferInfo) -> Result<(), StoreError> {
        self.put_json(&reservation_key(slot_id), info)
    }

    pub fn delete_reservation(&self, slot_id: &SlotId) -> Result<(), StoreError> {
        self.kv.delete(&reservation_key(slot_id))
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Loads every app with its slots and tasks.
    pub fn load_app_data(&self) -> Result<Vec<AppData>, StoreError> {
        let apps: Vec<AppRecord> = self.scan_json("/apps/")?;
        let mut out = Vec::with_capacity(apps.len());

        for app in apps {
            let slot_records: Vec<SlotRecord> =
                self.scan_json(&format!("/slots/{}/", app.id))?;
            let mut slots = Vec::with_capacity(slot_records.len());
            for slot in slot_records {
                let tasks: Vec<Task> = self.scan_json(&tasks_prefix(&slot.id))?;
                slots.push(SlotData { slot, tasks });
            }
            debug!(app_id = %app.id, slots = slots.len(), "Loaded app");
            out.push(AppData { app, slots });
        }

        Ok(out)
    }

    /// Loads the slot → offer reservation map.
    pub fn load_offer_allocator_state(&self) -> Result<HashMap<SlotId, OfferInfo>, StoreError> {
        let mut reservations = HashMap::new();
        for (key, value) in self.kv.scan_prefix("/reservations/")? {
            let slot_id = key
                .rsplit('/')
                .next()
                .and_then(|raw| raw.parse::<SlotId>().ok())
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.clone(),
                    reason: "key does not end in a slot id".to_string(),
                })?;
            reservations.insert(slot_id, Self::decode(&key, &value)?);
        }
        Ok(reservations)
    }
}
