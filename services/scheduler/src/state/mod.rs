//! Scheduler state: apps, slots, tasks, offers and their bookkeeping.
//!
//! Ownership is a tree. The scheduler core owns every [`App`]; an app owns
//! its [`Slot`]s by index; a slot owns its current [`Task`] and its history.
//! Nothing points back up. Shared collaborators (store, allocator, event
//! bus, command sink) are lent to each operation through [`Services`] and
//! [`SlotEnv`].

pub mod allocator;
pub mod app;
pub mod constraint;
pub mod offer;
pub mod restart;
pub mod slot;
pub mod task;
pub mod version;

pub use allocator::{OfferAllocator, OfferInfo};
pub use app::{App, AppRecord, AppStatus, AppSummary};
pub use constraint::{ConstraintError, ConstraintEvaluator, SimpleConstraints};
pub use offer::{AllocError, Offer, OfferWrapper, PortRange, ResourceClaim};
pub use restart::{RestartPolicy, RestartPolicyConfig};
pub use slot::{Slot, SlotRecord, SlotTx};
pub use task::{Task, TaskInfo};
pub use version::{AppSpec, ContainerSpec, HealthCheck, PortMapping, ValidationError, Version};

use berth_events::AppMode;
use berth_id::AppId;

use crate::bus::EventBus;
use crate::connector::CommandSink;
use crate::store::StateStore;

/// Collaborators lent to app and slot operations.
pub struct Services<'a> {
    pub store: &'a StateStore,
    pub allocator: &'a mut OfferAllocator,
    pub events: &'a EventBus,
    pub commands: &'a CommandSink,
    pub constraints: &'a dyn ConstraintEvaluator,
    pub restart_defaults: &'a RestartPolicyConfig,
}

/// App-level facts a slot needs to describe itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AppMeta {
    pub app_id: AppId,
    pub mode: AppMode,
    pub cluster_id: String,
}

/// Per-operation environment for one slot.
///
/// Slot operations that should roll up into the app's status call
/// [`SlotEnv::request_step`]; the owning app runs `step()` once after the
/// operation returns, however many times it was requested.
pub struct SlotEnv<'a> {
    pub store: &'a StateStore,
    pub allocator: &'a mut OfferAllocator,
    pub events: &'a EventBus,
    pub commands: &'a CommandSink,
    pub constraints: &'a dyn ConstraintEvaluator,
    pub app: &'a AppMeta,
    step_requested: bool,
}

impl<'a> SlotEnv<'a> {
    pub fn new(services: &'a mut Services<'_>, app: &'a AppMeta) -> Self {
        Self {
            store: services.store,
            allocator: &mut *services.allocator,
            events: services.events,
            commands: services.commands,
            constraints: services.constraints,
            app,
            step_requested: false,
        }
    }

    pub fn request_step(&mut self) {
        self.step_requested = true;
    }

    pub fn step_requested(&self) -> bool {
        self.step_requested
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators for slot and app tests.

    use std::collections::BTreeMap;
    use std::sync::Arc;

    use berth_events::{AppMode, LifecycleEvent};
    use berth_id::{AgentId, AppId, OfferId};
    use tokio::sync::{broadcast, mpsc};

    use super::*;
    use crate::connector::Command;
    use crate::store::MemoryKv;

    pub(crate) struct Harness {
        pub kv: Arc<MemoryKv>,
        pub store: StateStore,
        pub allocator: OfferAllocator,
        pub events: EventBus,
        pub events_rx: broadcast::Receiver<LifecycleEvent>,
        pub commands: CommandSink,
        pub commands_rx: mpsc::Receiver<Command>,
        pub constraints: SimpleConstraints,
        pub restart: RestartPolicyConfig,
        pub meta: AppMeta,
    }

    impl Harness {
        pub(crate) fn new(mode: AppMode) -> Self {
            let kv = Arc::new(MemoryKv::new());
            let events = EventBus::new(256);
            let events_rx = events.subscribe();
            let (commands, commands_rx) = CommandSink::channel(64);
            Self {
                store: StateStore::new(kv.clone()),
                kv,
                allocator: OfferAllocator::new(),
                events,
                events_rx,
                commands,
                commands_rx,
                constraints: SimpleConstraints,
                restart: RestartPolicyConfig::default(),
                meta: AppMeta {
                    app_id: AppId::parse("web").unwrap(),
                    mode,
                    cluster_id: "dc1".to_string(),
                },
            }
        }

        /// Borrows the collaborators and the app meta side by side.
        pub(crate) fn parts(&mut self) -> (Services<'_>, &AppMeta) {
            (
                Services {
                    store: &self.store,
                    allocator: &mut self.allocator,
                    events: &self.events,
                    commands: &self.commands,
                    constraints: &self.constraints,
                    restart_defaults: &self.restart,
                },
                &self.meta,
            )
        }

        pub(crate) fn drain_events(&mut self) -> Vec<LifecycleEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events_rx.try_recv() {
                out.push(event);
            }
            out
        }

        pub(crate) fn drain_commands(&mut self) -> Vec<Command> {
            let mut out = Vec::new();
            while let Ok(command) = self.commands_rx.try_recv() {
                out.push(command);
            }
            out
        }

        /// Number of writes to slot keys so far.
        pub(crate) fn slot_writes(&self) -> usize {
            self.kv.writes_with_prefix("/slots/")
        }
    }

    /// An offer from `agent-1` on `host-1`.
    pub(crate) fn offer(cpus: f64, mem: f64, ports: Vec<(u16, u16)>) -> Offer {
        offer_from("offer-1", "agent-1", "host-1", cpus, mem, ports)
    }

    pub(crate) fn offer_from(
        id: &str,
        agent: &str,
        host: &str,
        cpus: f64,
        mem: f64,
        ports: Vec<(u16, u16)>,
    ) -> Offer {
        Offer {
            id: OfferId::parse(id).unwrap(),
            agent_id: AgentId::parse(agent).unwrap(),
            hostname: host.to_string(),
            cpus,
            mem,
            disk: 0.0,
            ports: ports
                .into_iter()
                .map(|(begin, end)| PortRange::new(begin, end))
                .collect(),
            attributes: BTreeMap::new(),
        }
    }
}
