//! Configuration for the scheduler binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_id::FrameworkId;

use crate::connector::{FrameworkInfo, MockConnectorConfig};
use crate::scheduler::SchedulerConfig;
use crate::state::{AppSpec, PortRange, RestartPolicyConfig};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the state database.
    pub data_dir: PathBuf,

    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Cluster name stamped on lifecycle events.
    pub cluster_id: String,

    pub framework: FrameworkInfo,

    pub heartbeat_interval: Duration,
    pub restart_check_interval: Duration,
    pub app_gc_interval: Duration,
    pub offer_interval: Duration,

    pub channel_capacity: usize,
    pub event_bus_capacity: usize,

    /// Restart tuning for versions without their own.
    pub restart: RestartPolicyConfig,

    /// Simulated cluster size for the mock connector.
    pub mock_agents: u32,
    pub mock_cpus: f64,
    pub mock_mem: f64,
    pub mock_disk: f64,
    pub mock_ports: PortRange,

    /// JSON file with apps to deploy at startup.
    pub bootstrap_apps: Option<PathBuf>,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{name}={raw}: {e}")),
        None => Ok(default),
    }
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    parsed(name, default).map(Duration::from_secs)
}

fn millis(name: &str, default: u64) -> Result<Duration> {
    parsed(name, default).map(Duration::from_millis)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = var("BERTH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/berth"));

        let log_level = var("BERTH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let cluster_id = var("BERTH_CLUSTER_ID").unwrap_or_else(|| "default".to_string());

        let defaults = FrameworkInfo::default();
        let framework_id = var("BERTH_FRAMEWORK_ID")
            .map(|raw| FrameworkId::parse(&raw))
            .transpose()
            .context("BERTH_FRAMEWORK_ID")?;
        let framework = FrameworkInfo {
            framework_id,
            name: var("BERTH_FRAMEWORK_NAME").unwrap_or(defaults.name),
            user: var("BERTH_FRAMEWORK_USER").unwrap_or(defaults.user),
            role: var("BERTH_FRAMEWORK_ROLE").unwrap_or(defaults.role),
            hostname: var("BERTH_FRAMEWORK_HOSTNAME").or(defaults.hostname),
            failover_timeout: secs(
                "BERTH_FAILOVER_TIMEOUT_SECS",
                defaults.failover_timeout.as_secs(),
            )?,
            checkpoint: parsed("BERTH_CHECKPOINT", defaults.checkpoint)?,
        };

        let restart_defaults = RestartPolicyConfig::default();
        let restart = RestartPolicyConfig {
            backoff_secs: parsed("BERTH_RESTART_BACKOFF_SECS", restart_defaults.backoff_secs)?,
            factor: parsed("BERTH_RESTART_FACTOR", restart_defaults.factor)?,
            max_delay_secs: parsed(
                "BERTH_RESTART_MAX_DELAY_SECS",
                restart_defaults.max_delay_secs,
            )?,
            max_retries: var("BERTH_RESTART_MAX_RETRIES")
                .map(|raw| raw.trim().parse::<u32>())
                .transpose()
                .context("BERTH_RESTART_MAX_RETRIES")?,
        };
        if restart.factor.is_nan() || restart.factor < 1.0 {
            anyhow::bail!("BERTH_RESTART_FACTOR must be at least 1.0");
        }

        let mock = MockConnectorConfig::default();
        let mock_ports = match var("BERTH_MOCK_PORTS") {
            Some(raw) => parse_port_range(&raw)?,
            None => mock.ports,
        };

        Ok(Self {
            data_dir,
            log_level,
            cluster_id,
            framework,
            heartbeat_interval: secs(
                "BERTH_HEARTBEAT_INTERVAL_SECS",
                mock.heartbeat_interval.as_secs(),
            )?,
            restart_check_interval: millis("BERTH_RESTART_CHECK_INTERVAL_MS", 1000)?,
            app_gc_interval: secs("BERTH_APP_GC_INTERVAL_SECS", 5)?,
            offer_interval: millis("BERTH_OFFER_INTERVAL_MS", 1000)?,
            channel_capacity: parsed("BERTH_CHANNEL_CAPACITY", 1024)?,
            event_bus_capacity: parsed("BERTH_EVENT_BUS_CAPACITY", 1024)?,
            restart,
            mock_agents: parsed("BERTH_MOCK_AGENTS", mock.agents)?,
            mock_cpus: parsed("BERTH_MOCK_CPUS", mock.cpus_per_agent)?,
            mock_mem: parsed("BERTH_MOCK_MEM", mock.mem_per_agent)?,
            mock_disk: parsed("BERTH_MOCK_DISK", mock.disk_per_agent)?,
            mock_ports,
            bootstrap_apps: var("BERTH_BOOTSTRAP_APPS").map(PathBuf::from),
        })
    }

    /// Path of the SQLite state database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("berth.db")
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            cluster_id: self.cluster_id.clone(),
            framework: self.framework.clone(),
            restart_check_interval: self.restart_check_interval,
            app_gc_interval: self.app_gc_interval,
            user_event_capacity: self.channel_capacity,
            connector_event_capacity: self.channel_capacity,
            command_capacity: self.channel_capacity,
            event_bus_capacity: self.event_bus_capacity,
            restart_defaults: self.restart.clone(),
        }
    }

    pub fn mock_connector_config(&self) -> MockConnectorConfig {
        MockConnectorConfig {
            agents: self.mock_agents,
            cpus_per_agent: self.mock_cpus,
            mem_per_agent: self.mock_mem,
            disk_per_agent: self.mock_disk,
            ports: self.mock_ports,
            offer_interval: self.offer_interval,
            heartbeat_interval: self.heartbeat_interval,
            fail_launches: false,
        }
    }

    /// Reads the bootstrap app list, if one is configured.
    pub fn load_bootstrap_apps(&self) -> Result<Vec<AppSpec>> {
        let Some(path) = &self.bootstrap_apps else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Parses `begin-end`.
fn parse_port_range(raw: &str) -> Result<PortRange> {
    let (begin, end) = raw
        .trim()
        .split_once('-')
        .with_context(|| format!("BERTH_MOCK_PORTS={raw}: expected <begin>-<end>"))?;
    let begin: u16 = begin.trim().parse().context("BERTH_MOCK_PORTS begin")?;
    let end: u16 = end.trim().parse().context("BERTH_MOCK_PORTS end")?;
    if begin > end {
        anyhow::bail!("BERTH_MOCK_PORTS={raw}: begin is after end");
    }
    Ok(PortRange::new(begin, end))
}
