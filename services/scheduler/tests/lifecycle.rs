//! Slot lifecycle through status updates: restarts, kills and completion.


use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_events::{SlotState, TaskEventType};
use berth_scheduler::connector::{Command, TaskState};
use berth_scheduler::state::{AppStatus, RestartPolicyConfig};
use berth_scheduler::StateStore;
use harness::{app, offer, spec, TestCore};

fn running(t: &mut TestCore) -> berth_id::TaskId {
    t.core.deploy(spec("web", 1)).unwrap();
    t.core.place_offer(offer("o-1", 4.0, 4096.0, &[(31000, 31010)]));
    let task_id = t.launched().remove(0);
    t.report(&task_id, TaskState::Starting);
    t.report(&task_id, TaskState::Running);
    task_id
}

#[test]
fn test_lost_task_is_replaced_then_backs_off() {
    let mut t = TestCore::new();
    let first = running(&mut t);

    // First abnormal exit restarts immediately.
    t.report(&first, TaskState::Lost);
    let slot = t.core.app(&app("web")).unwrap().slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::PendingOffer);
    assert_eq!(slot.task_history().len(), 1);
    assert_eq!(slot.task_history()[0].final_state, Some(SlotState::Lost));
    assert_eq!(slot.restart_policy().retries(), 1);

    t.core.place_offer(offer("o-2", 4.0, 4096.0, &[(31000, 31010)]));
    let second = t.launched().remove(0);
    assert_ne!(first, second);
    t.report(&second, TaskState::Running);

    // The second waits out the backoff.
    t.report(&second, TaskState::Failed);
    let slot = t.core.app(&app("web")).unwrap().slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::Failed);
    assert_eq!(t.core.sweep_restarts(Instant::now()), 0);

    let later = Instant::now() + Duration::from_secs(11);
    assert_eq!(t.core.sweep_restarts(later), 1);
    let slot = t.core.app(&app("web")).unwrap().slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::PendingOffer);
    assert_eq!(slot.restart_policy().retries(), 2);
}

#[test]
fn test_retry_budget_is_honored() {
    let restart = RestartPolicyConfig {
        max_retries: Some(1),
        ..RestartPolicyConfig::default()
    };
    let mut t = TestCore::with_restart(Arc::new(StateStore::in_memory()), restart);
    let first = running(&mut t);

    t.report(&first, TaskState::Failed);
    t.core.place_offer(offer("o-2", 4.0, 4096.0, &[(31000, 31010)]));
    let second = t.launched().remove(0);
    t.report(&second, TaskState::Failed);

    let later = Instant::now() + Duration::from_secs(3600);
    assert_eq!(t.core.sweep_restarts(later), 0);
    let slot = t.core.app(&app("web")).unwrap().slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::Failed);
    assert!(!slot.restart_policy().is_armed());
}

#[test]
fn test_updates_after_kill_never_restart() {
    let mut t = TestCore::new();
    let task_id = running(&mut t);

    t.core.delete(&app("web")).unwrap();
    let kills = t
        .drain()
        .into_iter()
        .filter(|c| matches!(c, Command::Kill { .. }))
        .count();
    assert_eq!(kills, 1);

    // The task dies of something else before the kill lands.
    t.report(&task_id, TaskState::Failed);
    assert_eq!(t.core.sweep_restarts(Instant::now() + Duration::from_secs(3600)), 0);
    assert!(t.launched().is_empty());
    assert_eq!(t.core.allocator().pending_len(), 0);

    assert_eq!(t.core.invalidate_apps(), vec![app("web")]);
}

#[test]
fn test_finished_stops_policy_and_steps_once() {
    let mut t = TestCore::new();
    let task_id = running(&mut t);
    let mut events = t.core.events().subscribe();
    let revision = t.core.app(&app("web")).unwrap().revision();

    t.report(&task_id, TaskState::Finished);

    let app_ref = t.core.app(&app("web")).unwrap();
    assert_eq!(app_ref.revision(), revision + 1);
    assert_eq!(*app_ref.status(), AppStatus::Degraded);

    let slot = app_ref.slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::Finished);
    assert!(!slot.restart_policy().is_armed());
    assert!(slot.reservation().is_none());

    let event = events.try_recv().unwrap();
    assert_eq!(event.event_type, TaskEventType::State(SlotState::Finished));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_restart_on_finished_restarts() {
    let mut t = TestCore::new();
    let mut s = spec("batch", 1);
    s.version.restart_on_finished = true;
    t.core.deploy(s).unwrap();
    t.core.place_offer(offer("o-1", 4.0, 4096.0, &[(31000, 31010)]));
    let task_id = t.launched().remove(0);
    t.report(&task_id, TaskState::Running);

    t.report(&task_id, TaskState::Finished);

    let slot = t.core.app(&app("batch")).unwrap().slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::PendingOffer);
}

#[test]
fn test_rolling_update_replaces_one_slot_at_a_time() {
    let mut t = TestCore::new();
    t.core.deploy(spec("web", 2)).unwrap();
    t.core.place_offer(offer("o-1", 4.0, 4096.0, &[(31000, 31010)]));
    for task_id in t.launched() {
        t.report(&task_id, TaskState::Running);
    }

    let mut next = harness::version(1.0, 256.0, 2);
    next.labels.insert("release".to_string(), "2".to_string());
    let next_id = next.id;
    t.core.update(&app("web"), next).unwrap();

    // Slot 0 is replaced first; slot 1 keeps running.
    let kills = killed_slots(&mut t);
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].slot_id().index(), 0);
    let app_ref = t.core.app(&app("web")).unwrap();
    assert_eq!(app_ref.slot(0).unwrap().state(), SlotState::PendingOffer);
    assert_eq!(app_ref.slot(1).unwrap().state(), SlotState::Running);

    // A late report for the replaced attempt is ignored.
    t.report(&kills[0], TaskState::Killed);

    t.core.place_offer(offer("o-2", 4.0, 4096.0, &[(31000, 31010)]));
    let replacement = t.launched().remove(0);
    assert_eq!(replacement.slot_id().index(), 0);
    t.report(&replacement, TaskState::Running);

    // Slot 0 is ready on the new version, so slot 1 goes next.
    let kills = killed_slots(&mut t);
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].slot_id().index(), 1);

    let app_ref = t.core.app(&app("web")).unwrap();
    assert_eq!(app_ref.slot(0).unwrap().version().id, next_id);
    assert_eq!(app_ref.slot(1).unwrap().version().id, next_id);
    assert_eq!(app_ref.slot(1).unwrap().state(), SlotState::PendingOffer);
    assert!(matches!(app_ref.status(), AppStatus::Updating { .. }));

    t.core.place_offer(offer("o-3", 4.0, 4096.0, &[(31000, 31010)]));
    let last = t.launched().remove(0);
    t.report(&last, TaskState::Running);

    let app_ref = t.core.app(&app("web")).unwrap();
    assert_eq!(*app_ref.status(), AppStatus::Normal);
    assert_eq!(app_ref.current_version().id, next_id);
    assert!(app_ref.proposed_version().is_none());
}

fn killed_slots(t: &mut TestCore) -> Vec<berth_id::TaskId> {
    t.drain()
        .into_iter()
        .filter_map(|c| match c {
            Command::Kill { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect()
}
