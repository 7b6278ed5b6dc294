//! Placement attempts and launch descriptors.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use berth_events::{AppMode, SlotState};
use berth_id::{AgentId, OfferId, SlotId, TaskId, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::offer::{Offer, PortRange};
use super::version::{HealthCheck, Version};
use crate::connector::{Command, CommandSink};

// =============================================================================
// Launch Descriptor
// =============================================================================

/// A resource claimed by a launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    Scalar { name: String, value: f64 },
    Ranges { name: String, ranges: Vec<PortRange> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub name: String,
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub image: String,
    pub network: String,
    pub force_pull: bool,
    pub parameters: BTreeMap<String, String>,
    pub ip: Option<IpAddr>,
    pub port_bindings: Vec<PortBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub shell: bool,
    pub value: Option<String>,
    pub arguments: Vec<String>,
    pub user: String,
    pub environment: BTreeMap<String, String>,
}

/// Everything the resource manager needs to start one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub resources: Vec<Resource>,
    pub container: ContainerInfo,
    pub command: CommandInfo,
    pub labels: BTreeMap<String, String>,
    pub health_check: Option<HealthCheck>,
    pub kill_grace_period: Option<Duration>,
}

impl TaskInfo {
    /// Sum of a scalar resource across the descriptor.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter_map(|r| match r {
                Resource::Scalar { name: n, value } if n == name => Some(*value),
                _ => None,
            })
            .sum()
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.container
            .port_bindings
            .iter()
            .map(|b| b.host_port)
            .collect()
    }
}

/// Scalar resources for a version; zero amounts are omitted.
pub fn resources_needed(version: &Version) -> Vec<Resource> {
    [("cpus", version.cpus), ("mem", version.mem), ("disk", version.disk)]
        .into_iter()
        .filter(|(_, value)| *value > 0.0)
        .map(|(name, value)| Resource::Scalar {
            name: name.to_string(),
            value,
        })
        .collect()
}

/// Collapses sorted ports into contiguous ranges.
fn port_ranges(ports: &[u16]) -> Vec<PortRange> {
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    let mut ranges: Vec<PortRange> = Vec::new();
    for port in sorted {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(port) => last.end = port,
            _ => ranges.push(PortRange::new(port, port)),
        }
    }
    ranges
}

/// Slot-level inputs to [`Task::prepare_task_info`].
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    pub mode: AppMode,
    pub cluster_id: &'a str,
    pub ip: Option<IpAddr>,
    pub host_ports: &'a [u16],
}

// =============================================================================
// Task
// =============================================================================

/// One placement attempt for a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub version_id: VersionId,
    pub offer_id: Option<OfferId>,
    pub agent_id: Option<AgentId>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub host_ports: Vec<u16>,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Slot state at the moment the task was archived.
    pub final_state: Option<SlotState>,
    /// Last message reported by the resource manager.
    #[serde(default)]
    pub message: Option<String>,
}

impl Task {
    pub fn new(slot_id: SlotId, version_id: VersionId) -> Self {
        Self {
            id: TaskId::new(slot_id),
            version_id,
            offer_id: None,
            agent_id: None,
            hostname: None,
            host_ports: Vec::new(),
            created_at: Utc::now(),
            archived_at: None,
            final_state: None,
            message: None,
        }
    }

    pub fn slot_id(&self) -> &SlotId {
        self.id.slot_id()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Records where the task was placed.
    pub fn set_offer_info(&mut self, offer: &Offer, host_ports: Vec<u16>) {
        self.offer_id = Some(offer.id.clone());
        self.agent_id = Some(offer.agent_id.clone());
        self.hostname = Some(offer.hostname.clone());
        self.host_ports = host_ports;
    }

    /// Freezes the task as history.
    pub fn archive(&mut self, final_state: SlotState) {
        if self.archived_at.is_none() {
            self.archived_at = Some(Utc::now());
            self.final_state = Some(final_state);
        }
    }

    /// Builds the launch descriptor for this task on `offer`.
    pub fn prepare_task_info(&self, version: &Version, offer: &Offer, ctx: &LaunchContext<'_>) -> TaskInfo {
        let slot_id = self.slot_id();

        let port_bindings: Vec<PortBinding> = match ctx.mode {
            AppMode::Replicated => version
                .container
                .port_mappings
                .iter()
                .zip(ctx.host_ports)
                .map(|(mapping, host_port)| PortBinding {
                    name: mapping.name.clone(),
                    container_port: mapping.container_port,
                    host_port: *host_port,
                    protocol: mapping.protocol.clone(),
                })
                .collect(),
            AppMode::Fixed => Vec::new(),
        };

        let mut resources = resources_needed(version);
        if !ctx.host_ports.is_empty() {
            resources.push(Resource::Ranges {
                name: "ports".to_string(),
                ranges: port_ranges(ctx.host_ports),
            });
        }

        let mut environment = version.env.clone();
        environment.insert("BERTH_APP_ID".to_string(), slot_id.app_id().to_string());
        environment.insert("BERTH_SLOT_INDEX".to_string(), slot_id.index().to_string());
        environment.insert("BERTH_TASK_ID".to_string(), self.id.to_string());
        environment.insert("BERTH_CLUSTER".to_string(), ctx.cluster_id.to_string());
        environment.insert("BERTH_HOST".to_string(), offer.hostname.clone());
        for binding in &port_bindings {
            environment.insert(
                format!("BERTH_PORT_{}", binding.name.to_uppercase().replace('-', "_")),
                binding.host_port.to_string(),
            );
        }

        let mut labels = version.labels.clone();
        labels.insert("berth.app".to_string(), slot_id.app_id().to_string());
        labels.insert("berth.slot".to_string(), slot_id.to_string());
        labels.insert("berth.version".to_string(), version.id.to_string());
        labels.insert("berth.cluster".to_string(), ctx.cluster_id.to_string());

        TaskInfo {
            task_id: self.id.clone(),
            name: format!("{}.{}", slot_id.index(), slot_id.app_id()),
            agent_id: offer.agent_id.clone(),
            resources,
            container: ContainerInfo {
                image: version.container.image.clone(),
                network: version.container.network.clone(),
                force_pull: version.container.force_pull,
                parameters: version.container.parameters.clone(),
                ip: ctx.ip,
                port_bindings,
            },
            command: CommandInfo {
                shell: version.command.is_some(),
                value: version.command.clone(),
                arguments: version.args.clone(),
                user: version.run_as.clone(),
                environment,
            },
            labels,
            health_check: version.health_check.clone(),
            kill_grace_period: version.kill_grace_period_secs.map(Duration::from_secs),
        }
    }

    /// Asks the resource manager to kill this task. Completion arrives later
    /// as a status update.
    pub fn kill(&self, commands: &CommandSink) {
        debug!(task_id = %self.id, "Sending kill");
        commands.send(Command::Kill {
            task_id: self.id.clone(),
            agent_id: self.agent_id.clone(),
        });
    }
}
