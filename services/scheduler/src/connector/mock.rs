//! Mock resource manager for development and tests.
//!
//! Simulates a fixed set of agents. Each offer tick rescinds whatever was
//! not used and re-offers every agent's free capacity. Launched tasks go
//! `Starting` then `Running`; kills answer `Killed`, or `Lost` for tasks the
//! mock never heard of.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use berth_id::{AgentId, FrameworkId, OfferId, TaskId, Ulid};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Command, Connector, ConnectorError, ConnectorEvent, FrameworkInfo, TaskState, TaskStatus};
use crate::state::{Offer, PortRange, TaskInfo};

#[derive(Debug, Clone, PartialEq)]
pub struct MockConnectorConfig {
    pub agents: u32,
    pub cpus_per_agent: f64,
    pub mem_per_agent: f64,
    pub disk_per_agent: f64,
    /// Host port range offered by every agent.
    pub ports: PortRange,
    pub offer_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Report every launch as failed.
    pub fail_launches: bool,
}

impl Default for MockConnectorConfig {
    fn default() -> Self {
        Self {
            agents: 3,
            cpus_per_agent: 8.0,
            mem_per_agent: 16384.0,
            disk_per_agent: 100_000.0,
            ports: PortRange::new(31000, 31999),
            offer_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            fail_launches: false,
        }
    }
}

#[derive(Debug)]
struct MockAgent {
    id: AgentId,
    hostname: String,
    cpus: f64,
    mem: f64,
    disk: f64,
    ports: BTreeSet<u16>,
}

#[derive(Debug)]
struct MockTask {
    agent: usize,
    cpus: f64,
    mem: f64,
    disk: f64,
    ports: Vec<u16>,
    state: TaskState,
}

pub struct MockConnector {
    config: MockConnectorConfig,
    agents: Vec<MockAgent>,
    tasks: HashMap<TaskId, MockTask>,
    /// Outstanding offers by agent index.
    offers: HashMap<OfferId, usize>,
    offer_counter: u64,
}

impl MockConnector {
    pub fn new(config: MockConnectorConfig) -> Self {
        let agents = (0..config.agents)
            .filter_map(|i| {
                let id = AgentId::parse(&format!("mock-agent-{i}")).ok()?;
                Some(MockAgent {
                    id,
                    hostname: format!("mock-{i}.local"),
                    cpus: config.cpus_per_agent,
                    mem: config.mem_per_agent,
                    disk: config.disk_per_agent,
                    ports: (config.ports.begin..=config.ports.end).collect(),
                })
            })
            .collect();

        Self {
            config,
            agents,
            tasks: HashMap::new(),
            offers: HashMap::new(),
            offer_counter: 0,
        }
    }

    /// A mock whose launches all fail.
    pub fn failing() -> Self {
        Self::new(MockConnectorConfig {
            fail_launches: true,
            ..MockConnectorConfig::default()
        })
    }

    fn next_offer_id(&mut self) -> Result<OfferId, ConnectorError> {
        self.offer_counter += 1;
        OfferId::parse(&format!("mock-offer-{:06}", self.offer_counter))
            .map_err(|e| ConnectorError::Disconnected(e.to_string()))
    }

    /// Offers each agent's free capacity.
    fn build_offers(&mut self) -> Result<Vec<Offer>, ConnectorError> {
        let mut offers = Vec::new();
        for index in 0..self.agents.len() {
            let agent = &self.agents[index];
            if agent.cpus <= 0.0 || agent.mem <= 0.0 {
                continue;
            }
            let ports = collapse(&agent.ports);
            let (agent_id, hostname) = (agent.id.clone(), agent.hostname.clone());
            let (cpus, mem, disk) = (agent.cpus, agent.mem, agent.disk);

            let id = self.next_offer_id()?;
            self.offers.insert(id.clone(), index);
            offers.push(Offer {
                id,
                agent_id,
                hostname,
                cpus,
                mem,
                disk,
                ports,
                attributes: [("rack".to_string(), format!("r{}", index % 2))]
                    .into_iter()
                    .collect(),
            });
        }
        Ok(offers)
    }

    /// Starts `task` on agent `index`, or returns the failure state.
    fn start_task(&mut self, index: usize, task: &TaskInfo) -> Result<(), (TaskState, String)> {
        if self.config.fail_launches {
            return Err((TaskState::Failed, "mock configured to fail".to_string()));
        }

        let agent = &mut self.agents[index];
        let (cpus, mem, disk) = (task.scalar("cpus"), task.scalar("mem"), task.scalar("disk"));
        let ports = task.host_ports();
        if agent.cpus < cpus
            || agent.mem < mem
            || agent.disk < disk
            || !ports.iter().all(|p| agent.ports.contains(p))
        {
            return Err((TaskState::Error, "insufficient resources on agent".to_string()));
        }

        agent.cpus -= cpus;
        agent.mem -= mem;
        agent.disk -= disk;
        for port in &ports {
            agent.ports.remove(port);
        }

        info!(
            task_id = %task.task_id,
            agent_id = %agent.id,
            cpus,
            mem,
            "[MOCK] Starting task"
        );
        self.tasks.insert(
            task.task_id.clone(),
            MockTask {
                agent: index,
                cpus,
                mem,
                disk,
                ports,
                state: TaskState::Running,
            },
        );
        Ok(())
    }

    fn stop_task(&mut self, task_id: &TaskId) -> bool {
        let Some(task) = self.tasks.remove(task_id) else {
            return false;
        };
        let agent = &mut self.agents[task.agent];
        agent.cpus += task.cpus;
        agent.mem += task.mem;
        agent.disk += task.disk;
        agent.ports.extend(task.ports);
        debug!(task_id = %task_id, state = ?task.state, "[MOCK] Task stopped");
        true
    }

    fn status(&self, task_id: &TaskId, state: TaskState) -> TaskStatus {
        let mut status = TaskStatus::new(task_id.to_string(), state);
        status.agent_id = self
            .tasks
            .get(task_id)
            .map(|t| self.agents[t.agent].id.clone());
        status
    }

    /// Applies one command and returns the status updates it produces.
    fn handle_command(&mut self, command: Command) -> Vec<TaskStatus> {
        let mut updates = Vec::new();
        match command {
            Command::Launch { offer_id, tasks, .. } => {
                let Some(index) = self.offers.remove(&offer_id) else {
                    warn!(offer_id = %offer_id, "[MOCK] Launch on unknown offer");
                    for task in tasks {
                        let mut status = TaskStatus::new(task.task_id.to_string(), TaskState::Lost);
                        status.reason = Some("offer rescinded".to_string());
                        updates.push(status);
                    }
                    return updates;
                };

                for task in tasks {
                    match self.start_task(index, &task) {
                        Ok(()) => {
                            updates.push(self.status(&task.task_id, TaskState::Starting));
                            let mut running = self.status(&task.task_id, TaskState::Running);
                            if task.health_check.is_some() {
                                running.healthy = Some(true);
                            }
                            updates.push(running);
                        }
                        Err((state, message)) => {
                            let mut status = TaskStatus::new(task.task_id.to_string(), state);
                            status.message = Some(message);
                            updates.push(status);
                        }
                    }
                }
            }
            Command::Kill { task_id, .. } => {
                let mut status = self.status(&task_id, TaskState::Killed);
                if !self.stop_task(&task_id) {
                    status.state = TaskState::Lost;
                    status.reason = Some("unknown task".to_string());
                }
                updates.push(status);
            }
            Command::Reconcile { tasks } => {
                for (task_id, _) in tasks {
                    let state = self
                        .tasks
                        .get(&task_id)
                        .map(|t| t.state)
                        .unwrap_or(TaskState::Lost);
                    updates.push(self.status(&task_id, state));
                }
            }
        }
        updates
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new(MockConnectorConfig::default())
    }
}

/// Collapses a sorted port set into ranges.
fn collapse(ports: &BTreeSet<u16>) -> Vec<PortRange> {
    let mut ranges: Vec<PortRange> = Vec::new();
    for &port in ports {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(port) => last.end = port,
            _ => ranges.push(PortRange::new(port, port)),
        }
    }
    ranges
}

async fn emit(events: &mpsc::Sender<ConnectorEvent>, event: ConnectorEvent) -> Result<(), ConnectorError> {
    events
        .send(event)
        .await
        .map_err(|_| ConnectorError::ChannelClosed)
}

#[async_trait]
impl Connector for MockConnector {
    async fn run(
        mut self: Box<Self>,
        framework: FrameworkInfo,
        events: mpsc::Sender<ConnectorEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let framework_id = match framework.framework_id {
            Some(id) => id,
            None => FrameworkId::parse(&format!("mock-{}", Ulid::new()))
                .map_err(|e| ConnectorError::Rejected(e.to_string()))?,
        };
        info!(
            framework_id = %framework_id,
            name = %framework.name,
            agents = self.agents.len(),
            "[MOCK] Framework subscribed"
        );
        emit(&events, ConnectorEvent::Subscribed { framework_id }).await?;

        let mut offer_tick = tokio::time::interval(self.config.offer_interval);
        offer_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("[MOCK] Connector shutting down");
                        return Ok(());
                    }
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    for status in self.handle_command(command) {
                        emit(&events, ConnectorEvent::Update(status)).await?;
                    }
                }

                _ = offer_tick.tick() => {
                    let stale: Vec<OfferId> = self.offers.drain().map(|(id, _)| id).collect();
                    for offer_id in stale {
                        emit(&events, ConnectorEvent::Rescind(offer_id)).await?;
                    }
                    let offers = self.build_offers()?;
                    if !offers.is_empty() {
                        emit(&events, ConnectorEvent::Offers(offers)).await?;
                    }
                }

                _ = heartbeat.tick() => {
                    emit(&events, ConnectorEvent::Heartbeat).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::task::{CommandInfo, ContainerInfo, PortBinding, Resource};
    use berth_id::{AppId, SlotId};
    use std::collections::BTreeMap;

    fn config() -> MockConnectorConfig {
        MockConnectorConfig {
            agents: 1,
            cpus_per_agent: 2.0,
            mem_per_agent: 1024.0,
            disk_per_agent: 0.0,
            ports: PortRange::new(31000, 31001),
            offer_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(60),
            fail_launches: false,
        }
    }

    fn task_info(agent_id: &AgentId, port: u16) -> TaskInfo {
        TaskInfo {
            task_id: TaskId::new(SlotId::new(AppId::parse("web").unwrap(), 0)),
            name: "0.web".to_string(),
            agent_id: agent_id.clone(),
            resources: vec![
                Resource::Scalar {
                    name: "cpus".to_string(),
                    value: 1.0,
                },
                Resource::Scalar {
                    name: "mem".to_string(),
                    value: 512.0,
                },
            ],
            container: ContainerInfo {
                image: "nginx:1.27".to_string(),
                network: "bridge".to_string(),
                force_pull: false,
                parameters: BTreeMap::new(),
                ip: None,
                port_bindings: vec![PortBinding {
                    name: "http".to_string(),
                    container_port: 80,
                    host_port: port,
                    protocol: "tcp".to_string(),
                }],
            },
            command: CommandInfo {
                shell: false,
                value: None,
                arguments: vec![],
                user: "root".to_string(),
                environment: BTreeMap::new(),
            },
            labels: BTreeMap::new(),
            health_check: None,
            kill_grace_period: None,
        }
    }

    #[test]
    fn test_launch_and_kill() {
        let mut mock = MockConnector::new(config());
        let offer = mock.build_offers().unwrap().remove(0);
        assert_eq!(offer.cpus, 2.0);
        assert_eq!(offer.port_count(), 2);

        let info = task_info(&offer.agent_id, 31000);
        let updates = mock.handle_command(Command::Launch {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            tasks: vec![info.clone()],
        });
        let states: Vec<TaskState> = updates.iter().map(|u| u.state).collect();
        assert_eq!(states, vec![TaskState::Starting, TaskState::Running]);

        let offer = mock.build_offers().unwrap().remove(0);
        assert_eq!(offer.cpus, 1.0);
        assert_eq!(offer.ports, vec![PortRange::new(31001, 31001)]);

        let updates = mock.handle_command(Command::Kill {
            task_id: info.task_id.clone(),
            agent_id: None,
        });
        assert_eq!(updates[0].state, TaskState::Killed);

        let updates = mock.handle_command(Command::Kill {
            task_id: info.task_id,
            agent_id: None,
        });
        assert_eq!(updates[0].state, TaskState::Lost);
    }

    #[test]
    fn test_launch_on_rescinded_offer_is_lost() {
        let mut mock = MockConnector::new(config());
        let agent = AgentId::parse("mock-agent-0").unwrap();
        let updates = mock.handle_command(Command::Launch {
            offer_id: OfferId::parse("gone").unwrap(),
            agent_id: agent.clone(),
            tasks: vec![task_info(&agent, 31000)],
        });
        assert_eq!(updates[0].state, TaskState::Lost);
        assert_eq!(updates[0].reason.as_deref(), Some("offer rescinded"));
    }

    #[test]
    fn test_failing_mock() {
        let mut mock = MockConnector::failing();
        let offer = mock.build_offers().unwrap().remove(0);
        let updates = mock.handle_command(Command::Launch {
            offer_id: offer.id,
            agent_id: offer.agent_id.clone(),
            tasks: vec![task_info(&offer.agent_id, 31000)],
        });
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].state, TaskState::Failed);
    }

    #[test]
    fn test_reconcile_reports_unknown_as_lost() {
        let mut mock = MockConnector::new(config());
        let task_id = TaskId::new(SlotId::new(AppId::parse("web").unwrap(), 3));
        let updates = mock.handle_command(Command::Reconcile {
            tasks: vec![(task_id, None)],
        });
        assert_eq!(updates[0].state, TaskState::Lost);
    }

    #[tokio::test]
    async fn test_run_subscribes_then_offers() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_commands_tx, commands_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connector: Box<dyn Connector> = Box::new(MockConnector::new(config()));
        let handle = tokio::spawn(connector.run(
            FrameworkInfo::default(),
            events_tx,
            commands_rx,
            shutdown_rx,
        ));

        assert!(matches!(
            events_rx.recv().await,
            Some(ConnectorEvent::Subscribed { .. })
        ));
        loop {
            if let Some(ConnectorEvent::Offers(offers)) = events_rx.recv().await {
                assert_eq!(offers.len(), 1);
                break;
            }
        }

        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
