//! Workload version descriptors and deploy requests.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use berth_events::AppMode;
use berth_id::{AppId, VersionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::offer::ResourceClaim;
use super::restart::RestartPolicyConfig;

/// Rejections for deploy, scale and update requests.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{resource} must be a finite, non-negative number (got {value})")]
    InvalidResource { resource: &'static str, value: f64 },

    #[error("container image must not be empty")]
    MissingImage,

    #[error("fixed mode needs one IP per instance: {instances} instances, {ips} IPs")]
    MissingIps { instances: u32, ips: usize },

    #[error("duplicate IP {0}")]
    DuplicateIp(IpAddr),

    #[error("duplicate port mapping name '{0}'")]
    DuplicatePortName(String),

    #[error("health check references unknown port '{0}'")]
    UnknownHealthPort(String),

    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("backoff factor must be >= 1.0 (got {0})")]
    InvalidBackoffFactor(f64),
}

/// A named container port exposed through a host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub name: String,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Container settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub force_pull: bool,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_network() -> String {
    "bridge".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthProtocol {
    Http,
    Tcp,
    Command,
}

/// Health check executed next to the task by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: HealthProtocol,
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub grace_period_secs: u64,
    #[serde(default = "default_health_failures")]
    pub consecutive_failures: u32,
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_failures() -> u32 {
    3
}

/// One immutable revision of an app's definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    #[serde(default)]
    pub id: VersionId,
    pub cpus: f64,
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
    pub instances: u32,
    #[serde(default = "default_run_as")]
    pub run_as: String,
    pub container: ContainerSpec,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub constraints: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    /// Per-index IPs, fixed mode only.
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub restart: Option<RestartPolicyConfig>,
    /// Restart slots whose task finished successfully.
    #[serde(default)]
    pub restart_on_finished: bool,
    #[serde(default)]
    pub kill_grace_period_secs: Option<u64>,
}

fn default_run_as() -> String {
    "root".to_string()
}

impl Version {
    /// Resources one instance of this version asks for.
    pub fn claim(&self, mode: AppMode) -> ResourceClaim {
        ResourceClaim {
            cpus: self.cpus,
            mem: self.mem,
            disk: self.disk,
            ports: match mode {
                AppMode::Replicated => self.container.port_mappings.len(),
                AppMode::Fixed => 0,
            },
        }
    }

    /// IP pinned to `index`, fixed mode only.
    pub fn ip_for(&self, index: u32) -> Option<IpAddr> {
        self.ips.get(index as usize).copied()
    }

    pub fn validate(&self, mode: AppMode) -> Result<(), ValidationError> {
        for (resource, value) in [("cpus", self.cpus), ("mem", self.mem), ("disk", self.disk)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::InvalidResource { resource, value });
            }
        }

        if self.container.image.trim().is_empty() {
            return Err(ValidationError::MissingImage);
        }

        if mode == AppMode::Fixed {
            if self.ips.len() < self.instances as usize {
                return Err(ValidationError::MissingIps {
                    instances: self.instances,
                    ips: self.ips.len(),
                });
            }
            let mut seen = HashSet::new();
            if let Some(dup) = self.ips.iter().find(|ip| !seen.insert(**ip)) {
                return Err(ValidationError::DuplicateIp(*dup));
            }
        }

        let mut names = HashSet::new();
        for mapping in &self.container.port_mappings {
            if !names.insert(mapping.name.as_str()) {
                return Err(ValidationError::DuplicatePortName(mapping.name.clone()));
            }
        }

        if let Some(port) = self
            .health_check
            .as_ref()
            .and_then(|hc| hc.port_name.as_ref())
        {
            if !names.contains(port.as_str()) {
                return Err(ValidationError::UnknownHealthPort(port.clone()));
            }
        }

        if let Some(restart) = &self.restart {
            if restart.factor.is_nan() || restart.factor < 1.0 {
                return Err(ValidationError::InvalidBackoffFactor(restart.factor));
            }
        }

        Ok(())
    }
}

/// A deploy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: AppId,
    #[serde(default)]
    pub mode: AppMode,
    pub version: Version,
}
