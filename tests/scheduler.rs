use aether_kernel::kernel::event_bus::EventBus;
use aether_kernel::kernel::scheduler::{EventTrigger, Scheduler};
use chrono::Utc;
use serde_json::json;

fn scheduler() -> Scheduler {
    Scheduler::new(EventBus::new())
}

#[test]
fn adding_a_cron_job_computes_its_next_fire_time() {
    let sched = scheduler();
    let job = sched.add_cron_job("nightly-report".to_string(), "0 2 * * *".to_string(), json!({})).unwrap();
    assert!(job.next_fire_at.is_some());
    assert!(job.enabled);
}

#[test]
fn invalid_cron_expression_is_rejected_at_registration() {
    let sched = scheduler();
    let result = sched.add_cron_job("bad".to_string(), "not a cron expr".to_string(), json!({}));
    assert!(result.is_err());
}

#[test]
fn tick_fires_only_jobs_whose_schedule_is_due() {
    let sched = scheduler();
    // every minute, definitely due a minute from "now"
    sched.add_cron_job("every-minute".to_string(), "* * * * *".to_string(), json!({"role": "x"})).unwrap();
    let far_future = Utc::now() + chrono::Duration::days(400);
    let fired = sched.tick(far_future);
    assert_eq!(fired.len(), 1);

    // ticking again at the same instant should not refire the same minute
    let refired = sched.tick(far_future);
    assert!(refired.is_empty());
}

#[test]
fn registering_a_trigger_with_the_same_name_and_pattern_replaces_not_stacks() {
    let sched = scheduler();
    sched.add_trigger(EventTrigger {
        id: String::new(),
        name: "on-failure".to_string(),
        event_pattern: "process.exit".to_string(),
        filter: None,
        spawn_config: json!({"v": 1}),
        enabled: true,
        cooldown_ms: 0,
        last_fired_at: None,
        fire_count: 0,
    });
    sched.add_trigger(EventTrigger {
        id: String::new(),
        name: "on-failure".to_string(),
        event_pattern: "process.exit".to_string(),
        filter: None,
        spawn_config: json!({"v": 2}),
        enabled: true,
        cooldown_ms: 0,
        last_fired_at: None,
        fire_count: 0,
    });

    let triggers = sched.list_triggers();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].spawn_config, json!({"v": 2}));
}

#[test]
fn trigger_with_filter_only_fires_when_payload_matches() {
    let sched = scheduler();
    sched.add_trigger(EventTrigger {
        id: String::new(),
        name: "oom-only".to_string(),
        event_pattern: "resource.exceeded".to_string(),
        filter: Some(json!({"kind": "tokens"})),
        spawn_config: json!({}),
        enabled: true,
        cooldown_ms: 0,
        last_fired_at: None,
        fire_count: 0,
    });

    let no_match = sched.handle_event("resource.exceeded", &json!({"kind": "steps"}));
    assert!(no_match.is_empty());

    let matched = sched.handle_event("resource.exceeded", &json!({"kind": "tokens"}));
    assert_eq!(matched.len(), 1);
}

#[test]
fn trigger_cooldown_suppresses_immediate_refiring() {
    let sched = scheduler();
    sched.add_trigger(EventTrigger {
        id: String::new(),
        name: "chatty".to_string(),
        event_pattern: "agent.log".to_string(),
        filter: None,
        spawn_config: json!({}),
        enabled: true,
        cooldown_ms: 60_000,
        last_fired_at: None,
        fire_count: 0,
    });

    let first = sched.handle_event("agent.log", &json!({}));
    assert_eq!(first.len(), 1);

    let second = sched.handle_event("agent.log", &json!({}));
    assert!(second.is_empty(), "cooldown should suppress an immediate refire");
}
