//! End-to-end runs of the scheduler loop against channel and mock
//! connectors.


use std::sync::Arc;
use std::time::Duration;

use berth_events::SlotState;
use berth_id::FrameworkId;
use berth_scheduler::connector::{
    ChannelConnector, Command, ConnectorEvent, MockConnector, MockConnectorConfig, TaskState,
    TaskStatus,
};
use berth_scheduler::state::{AppStatus, PortRange};
use berth_scheduler::{Scheduler, SchedulerConfig, SchedulerError, StateStore};
use harness::{app, offer, spec, TestCore};
use tokio::time::timeout;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        cluster_id: "dc1".to_string(),
        restart_check_interval: Duration::from_millis(20),
        app_gc_interval: Duration::from_millis(20),
        ..SchedulerConfig::default()
    }
}

async fn next_launch(commands: &mut tokio::sync::mpsc::Receiver<Command>) -> Vec<berth_id::TaskId> {
    loop {
        match commands.recv().await.expect("connector closed") {
            Command::Launch { tasks, .. } => {
                return tasks.into_iter().map(|t| t.task_id).collect();
            }
            Command::Reconcile { .. } | Command::Kill { .. } => continue,
        }
    }
}

#[tokio::test]
async fn test_reload_queues_pending_slots_before_first_offer() {
    let store = Arc::new(StateStore::in_memory());
    {
        // A previous run placed slot 0 and left slot 1 waiting.
        let mut t = TestCore::with_store(Arc::clone(&store));
        t.core.deploy(spec("web", 2)).unwrap();
        t.core.place_offer(offer("o-1", 1.0, 4096.0, &[(31000, 31010)]));
        t.core.handle_subscribed(&FrameworkId::parse("fw-1").unwrap());
    }

    let scheduler = Scheduler::new(config(), Arc::clone(&store));
    let handle = scheduler.handle();
    let (connector, mut driver) = ChannelConnector::new(16);
    let running = tokio::spawn(scheduler.run(Box::new(connector)));

    // Re-registration carries the persisted framework id.
    let framework = (&mut driver.framework).await.unwrap();
    assert_eq!(framework.framework_id, Some(FrameworkId::parse("fw-1").unwrap()));

    driver
        .events
        .send(ConnectorEvent::Offers(vec![offer("o-2", 4.0, 4096.0, &[(31000, 31010)])]))
        .await
        .unwrap();

    let launched = timeout(Duration::from_secs(5), next_launch(&mut driver.commands))
        .await
        .unwrap();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].slot_id().index(), 1);

    let query = handle.query(Some(app("web"))).await.unwrap();
    assert_eq!(query.apps[0].states.get("staging"), Some(&2));

    handle.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_user_errors_reach_the_caller() {
    let scheduler = Scheduler::new(config(), Arc::new(StateStore::in_memory()));
    let handle = scheduler.handle();
    let (connector, _driver) = ChannelConnector::new(16);
    let running = tokio::spawn(scheduler.run(Box::new(connector)));

    handle.deploy(spec("web", 1)).await.unwrap();
    assert!(matches!(
        handle.deploy(spec("web", 1)).await,
        Err(SchedulerError::AppExists(_))
    ));
    assert!(matches!(
        handle.cancel_update(app("web")).await,
        Err(SchedulerError::NoUpdateInProgress(_))
    ));
    assert!(matches!(
        handle.delete(app("nope")).await,
        Err(SchedulerError::AppNotFound(_))
    ));

    handle.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deleted_app_is_collected() {
    let scheduler = Scheduler::new(config(), Arc::new(StateStore::in_memory()));
    let handle = scheduler.handle();
    let (connector, mut driver) = ChannelConnector::new(16);
    let running = tokio::spawn(scheduler.run(Box::new(connector)));

    handle.deploy(spec("web", 1)).await.unwrap();
    driver
        .events
        .send(ConnectorEvent::Offers(vec![offer("o-1", 4.0, 4096.0, &[(31000, 31010)])]))
        .await
        .unwrap();
    let task_id = next_launch(&mut driver.commands).await.remove(0);
    driver
        .events
        .send(ConnectorEvent::Update(TaskStatus::new(task_id.to_string(), TaskState::Running)))
        .await
        .unwrap();

    handle.delete(app("web")).await.unwrap();
    let killed = loop {
        if let Command::Kill { task_id, .. } = driver.commands.recv().await.unwrap() {
            break task_id;
        }
    };
    assert_eq!(killed, task_id);

    driver
        .events
        .send(ConnectorEvent::Update(TaskStatus::new(task_id.to_string(), TaskState::Killed)))
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        while !handle.summaries().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    handle.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_mock_cluster_runs_app() {
    let scheduler = Scheduler::new(config(), Arc::new(StateStore::in_memory()));
    let handle = scheduler.handle();
    let connector = MockConnector::new(MockConnectorConfig {
        agents: 2,
        cpus_per_agent: 2.0,
        mem_per_agent: 2048.0,
        ports: PortRange::new(31000, 31004),
        offer_interval: Duration::from_millis(20),
        ..MockConnectorConfig::default()
    });
    let running = tokio::spawn(scheduler.run(Box::new(connector)));

    handle.deploy(spec("web", 3)).await.unwrap();

    let summary = timeout(Duration::from_secs(5), async {
        loop {
            let apps = handle.summaries().await.unwrap();
            if apps[0].status == AppStatus::Normal {
                return apps[0].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(summary.running, 3);
    assert_eq!(summary.healthy, 3);
    assert_eq!(summary.states.get(SlotState::Running.as_str()), Some(&3));
    assert_eq!(handle.healthy_tasks(Some(app("web"))).await.unwrap().len(), 3);

    handle.stop();
    running.await.unwrap().unwrap();
}
