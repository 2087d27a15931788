use std::collections::HashMap;

use aether_kernel::config::ProcessConfig;
use aether_kernel::kernel::event_bus::EventBus;
use aether_kernel::kernel::process::{ProcessManager, ProcessState, Signal, SpawnConfig, KERNEL_PID};

fn spawn_config(priority: u8) -> SpawnConfig {
    SpawnConfig {
        role: "researcher".to_string(),
        goal: "summarize the quarterly report".to_string(),
        runtime: "builtin".to_string(),
        model: None,
        tools: vec![],
        priority,
        max_steps: 50,
        env: HashMap::new(),
        working_directory: "/".to_string(),
    }
}

fn manager(max_concurrent: usize) -> ProcessManager {
    let config = ProcessConfig { max_concurrent, ..ProcessConfig::default() };
    ProcessManager::new(config, EventBus::new())
}

#[tokio::test]
async fn spawn_beyond_concurrency_limit_queues_instead_of_admitting() {
    let mgr = manager(1);
    let first = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();
    assert!(!first.queued);

    let second = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();
    assert!(second.queued);
    assert_eq!(second.queue_position, Some(0));

    let process = mgr.get(first.pid).unwrap();
    assert_eq!(process.state, ProcessState::Created);
}

#[tokio::test]
async fn exiting_a_running_process_admits_the_next_queued_one_by_priority() {
    let mgr = manager(1);
    let running = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();
    mgr.start_running(running.pid);

    let low_priority = mgr.spawn(spawn_config(5), KERNEL_PID).unwrap();
    let high_priority = mgr.spawn(spawn_config(1), KERNEL_PID).unwrap();
    assert!(low_priority.queued);
    assert!(high_priority.queued);

    mgr.exit(running.pid, 0);
    let admitted = mgr.pump_wait_queue();

    assert_eq!(admitted, vec![high_priority.pid]);
    assert_eq!(mgr.queue_len(), 1);
}

#[tokio::test]
async fn signal_sigkill_transitions_straight_to_zombie() {
    let mgr = manager(4);
    let outcome = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();
    mgr.start_running(outcome.pid);

    assert!(mgr.signal(outcome.pid, Signal::Sigkill));
    let process = mgr.get(outcome.pid).unwrap();
    assert_eq!(process.state, ProcessState::Zombie);
}

#[tokio::test]
async fn pause_resume_round_trip_restores_running_state() {
    let mgr = manager(4);
    let outcome = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();
    mgr.start_running(outcome.pid);

    assert!(mgr.pause(outcome.pid));
    assert_eq!(mgr.get(outcome.pid).unwrap().state, ProcessState::Paused);

    assert!(mgr.resume(outcome.pid));
    assert_eq!(mgr.get(outcome.pid).unwrap().state, ProcessState::Running);
}

#[tokio::test]
async fn send_message_then_drain_empties_the_mailbox_once() {
    let mgr = manager(4);
    let outcome = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();

    mgr.send_message(KERNEL_PID, outcome.pid, "chat", serde_json::json!({"hello": "world"})).unwrap();
    mgr.send_message(KERNEL_PID, outcome.pid, "chat", serde_json::json!({"hello": "again"})).unwrap();

    let drained = mgr.drain(outcome.pid);
    assert_eq!(drained.len(), 2);
    assert!(drained.iter().all(|m| m.delivered));
    assert!(mgr.drain(outcome.pid).is_empty());
}

#[tokio::test]
async fn signaling_an_unknown_pid_reports_failure_for_every_signal_kind() {
    let mgr = manager(4);
    assert!(!mgr.signal(9999, Signal::Sigterm));
    assert!(!mgr.signal(9999, Signal::Sigkill));
    assert!(!mgr.signal(9999, Signal::Sigint));
}

#[tokio::test]
async fn shutdown_terminates_every_tracked_process() {
    let mgr = manager(4);
    let a = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();
    let b = mgr.spawn(spawn_config(3), KERNEL_PID).unwrap();
    mgr.start_running(a.pid);
    mgr.start_running(b.pid);

    mgr.shutdown().await;

    assert_eq!(mgr.active_len(), 0);
}
