//! Component H — the cron + trigger scheduler.
//!
//! Two independent firing mechanisms share one job store: cron jobs fire on
//! a wall-clock schedule, event triggers fire when a bus event matches a
//! pattern (with an optional cooldown and a JSON-path filter). Both publish
//! a `*.fired` event rather than calling into the process manager directly
//! — firing a job is "spawn a new agent with this config", which is the
//! caller's business (the kernel wires the bus subscription), keeping this
//! module's only outbound dependency the event bus itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cron::CronSchedule;
use super::event_bus::{matches_pattern, EventBus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub expression: String,
    pub spawn_config: Value,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// §3/§4.5: the number of times this job has fired, incremented once
    /// per `tick()` admission (including a manual backdate + one tick, per
    /// the §8 scenario).
    #[serde(default)]
    pub fire_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTrigger {
    /// §3/§6 reference a trigger id distinct from its (mutable) name.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub event_pattern: String,
    #[serde(default)]
    pub filter: Option<Value>,
    pub spawn_config: Value,
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(skip)]
    pub last_fired_at: Option<Instant>,
    /// §3: the number of times this trigger has fired.
    #[serde(default)]
    pub fire_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Matches a shallow JSON-path filter: every key in `filter` must be present
/// in `payload` with an equal value. Nested objects are compared by value
/// equality, not recursively merged — a trigger wanting finer matching
/// composes several top-level keys instead.
fn filter_matches(filter: &Value, payload: &Value) -> bool {
    let (Some(filter_obj), Some(payload_obj)) = (filter.as_object(), payload.as_object()) else {
        return filter == payload;
    };
    filter_obj.iter().all(|(k, v)| payload_obj.get(k) == Some(v))
}

struct Inner {
    cron_jobs: HashMap<String, (CronJob, CronSchedule)>,
    triggers: HashMap<String, EventTrigger>,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    bus: EventBus,
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner { cron_jobs: HashMap::new(), triggers: HashMap::new() }),
            bus,
        }
    }

    pub fn add_cron_job(
        &self,
        name: String,
        expression: String,
        spawn_config: Value,
    ) -> Result<CronJob, SchedulerError> {
        let schedule = CronSchedule::parse(&expression)
            .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;
        let next_fire_at = schedule.next_after(Utc::now());
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            expression,
            spawn_config,
            enabled: true,
            next_fire_at,
            last_fired_at: None,
            fire_count: 0,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.cron_jobs.insert(job.id.clone(), (job.clone(), schedule));
        Ok(job)
    }

    pub fn remove_cron_job(&self, id: &str) -> bool {
        self.inner.lock().unwrap().cron_jobs.remove(id).is_some()
    }

    pub fn set_cron_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some((job, _)) = inner.cron_jobs.get_mut(id) {
            job.enabled = enabled;
            true
        } else {
            false
        }
    }

    pub fn list_cron_jobs(&self) -> Vec<CronJob> {
        self.inner.lock().unwrap().cron_jobs.values().map(|(j, _)| j.clone()).collect()
    }

    /// Recomputes `next_fire_at` for every enabled job whose stored value is
    /// stale (in the past) — run once at startup so a restart after
    /// downtime doesn't immediately fire every overdue job at once.
    pub fn recompute_stale_schedules(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        for (job, schedule) in inner.cron_jobs.values_mut() {
            if job.enabled && job.next_fire_at.map(|t| t <= now).unwrap_or(true) {
                job.next_fire_at = schedule.next_after(now);
            }
        }
    }

    /// One scheduler tick: fires every enabled cron job whose `next_fire_at`
    /// has passed and publishes `cron.fired` for each, then reschedules it.
    /// Returns the fired jobs so the kernel can spawn agents for them.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<CronJob> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for (job, schedule) in inner.cron_jobs.values_mut() {
            if !job.enabled {
                continue;
            }
            if job.next_fire_at.map(|t| t <= now).unwrap_or(false) {
                job.last_fired_at = Some(now);
                job.next_fire_at = schedule.next_after(now);
                job.fire_count += 1;
                fired.push(job.clone());
            }
        }
        drop(inner);
        for job in &fired {
            self.bus.publish(
                "cron.fired",
                serde_json::json!({ "job_id": job.id, "name": job.name, "spawn_config": job.spawn_config }),
            );
        }
        fired
    }

    pub fn add_trigger(&self, mut trigger: EventTrigger) -> EventTrigger {
        if trigger.id.is_empty() {
            trigger.id = uuid::Uuid::new_v4().to_string();
        }
        let mut inner = self.inner.lock().unwrap();
        // Duplicate (name, event_pattern) pairs replace the existing
        // trigger rather than stacking — re-registering the same trigger
        // on restart must be idempotent, not grow the table unbounded.
        inner.triggers.retain(|_, t| !(t.name == trigger.name && t.event_pattern == trigger.event_pattern));
        inner.triggers.insert(trigger.name.clone(), trigger.clone());
        trigger
    }

    pub fn remove_trigger(&self, name: &str) -> bool {
        self.inner.lock().unwrap().triggers.remove(name).is_some()
    }

    pub fn list_triggers(&self) -> Vec<EventTrigger> {
        self.inner.lock().unwrap().triggers.values().cloned().collect()
    }

    /// Evaluates every trigger against an incoming bus event, firing the
    /// ones whose pattern matches, whose optional filter matches, and whose
    /// cooldown has elapsed. Returns the triggers that fired.
    pub fn handle_event(&self, kind: &str, payload: &Value) -> Vec<EventTrigger> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for trigger in inner.triggers.values_mut() {
            if !trigger.enabled || !matches_pattern(&trigger.event_pattern, kind) {
                continue;
            }
            if let Some(filter) = &trigger.filter {
                if !filter_matches(filter, payload) {
                    continue;
                }
            }
            if let Some(last) = trigger.last_fired_at {
                if last.elapsed().as_millis() < trigger.cooldown_ms as u128 {
                    continue;
                }
            }
            trigger.last_fired_at = Some(Instant::now());
            trigger.fire_count += 1;
            fired.push(trigger.clone());
        }
        drop(inner);
        for trigger in &fired {
            self.bus.publish(
                "trigger.fired",
                serde_json::json!({ "id": trigger.id, "name": trigger.name, "spawn_config": trigger.spawn_config }),
            );
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let scheduler = Scheduler::new(EventBus::new());
        let err = scheduler.add_cron_job("bad".into(), "not a cron".into(), Value::Null).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron(_)));
    }

    #[test]
    fn tick_fires_due_jobs_and_reschedules() {
        let scheduler = Scheduler::new(EventBus::new());
        let job = scheduler.add_cron_job("every-minute".into(), "* * * * *".into(), Value::Null).unwrap();
        let now = Utc::now();
        // Force it due immediately.
        {
            let mut inner = scheduler.inner.lock().unwrap();
            inner.cron_jobs.get_mut(&job.id).unwrap().0.next_fire_at = Some(now);
        }
        let fired = scheduler.tick(now);
        assert_eq!(fired.len(), 1);
        let jobs = scheduler.list_cron_jobs();
        assert!(jobs[0].next_fire_at.unwrap() > now);
    }

    #[test]
    fn disabled_job_never_fires() {
        let scheduler = Scheduler::new(EventBus::new());
        let job = scheduler.add_cron_job("x".into(), "* * * * *".into(), Value::Null).unwrap();
        scheduler.set_cron_enabled(&job.id, false);
        let now = Utc::now();
        {
            let mut inner = scheduler.inner.lock().unwrap();
            inner.cron_jobs.get_mut(&job.id).unwrap().0.next_fire_at = Some(now);
        }
        assert!(scheduler.tick(now).is_empty());
    }

    #[test]
    fn trigger_fires_on_pattern_match() {
        let scheduler = Scheduler::new(EventBus::new());
        scheduler.add_trigger(EventTrigger {
            id: String::new(),
            name: "on-spawn".into(),
            event_pattern: "process.*".into(),
            filter: None,
            spawn_config: Value::Null,
            enabled: true,
            cooldown_ms: 0,
            last_fired_at: None,
            fire_count: 0,
        });
        let fired = scheduler.handle_event("process.spawned", &serde_json::json!({}));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn trigger_respects_filter() {
        let scheduler = Scheduler::new(EventBus::new());
        scheduler.add_trigger(EventTrigger {
            id: String::new(),
            name: "on-error".into(),
            event_pattern: "process.exit".into(),
            filter: Some(serde_json::json!({ "code": 1 })),
            spawn_config: Value::Null,
            enabled: true,
            cooldown_ms: 0,
            last_fired_at: None,
            fire_count: 0,
        });
        assert!(scheduler.handle_event("process.exit", &serde_json::json!({ "code": 0 })).is_empty());
        assert_eq!(scheduler.handle_event("process.exit", &serde_json::json!({ "code": 1 })).len(), 1);
    }

    #[test]
    fn duplicate_name_and_pattern_replaces_not_stacks() {
        let scheduler = Scheduler::new(EventBus::new());
        for i in 0..3 {
            scheduler.add_trigger(EventTrigger {
                id: String::new(),
                name: "dup".into(),
                event_pattern: "a.*".into(),
                filter: None,
                spawn_config: serde_json::json!({ "i": i }),
                enabled: true,
                cooldown_ms: 0,
                last_fired_at: None,
                fire_count: 0,
            });
        }
        assert_eq!(scheduler.list_triggers().len(), 1);
        assert_eq!(scheduler.list_triggers()[0].spawn_config, serde_json::json!({ "i": 2 }));
    }

    #[test]
    fn cooldown_suppresses_rapid_refires() {
        let scheduler = Scheduler::new(EventBus::new());
        scheduler.add_trigger(EventTrigger {
            id: String::new(),
            name: "noisy".into(),
            event_pattern: "a.*".into(),
            filter: None,
            spawn_config: Value::Null,
            enabled: true,
            cooldown_ms: 60_000,
            last_fired_at: None,
            fire_count: 0,
        });
        assert_eq!(scheduler.handle_event("a.b", &Value::Null).len(), 1);
        assert!(scheduler.handle_event("a.b", &Value::Null).is_empty());
    }

    #[test]
    fn trigger_fire_count_increments_on_each_fire() {
        let scheduler = Scheduler::new(EventBus::new());
        scheduler.add_trigger(EventTrigger {
            id: String::new(),
            name: "counted".into(),
            event_pattern: "a.*".into(),
            filter: None,
            spawn_config: Value::Null,
            enabled: true,
            cooldown_ms: 0,
            last_fired_at: None,
            fire_count: 0,
        });
        scheduler.handle_event("a.b", &Value::Null);
        scheduler.handle_event("a.c", &Value::Null);
        let trigger = &scheduler.list_triggers()[0];
        assert_eq!(trigger.fire_count, 2);
        assert!(!trigger.id.is_empty());
    }

    #[test]
    fn cron_job_run_count_reaches_two_after_backdate_and_tick_scenario() {
        // §8: a job backdated into the past and ticked twice should report
        // run_count == 2, confirming fire_count advances once per admission
        // and survives the reschedule in between.
        let scheduler = Scheduler::new(EventBus::new());
        let job = scheduler.add_cron_job("every-minute".into(), "* * * * *".into(), Value::Null).unwrap();
        assert_eq!(job.fire_count, 0);

        let now = Utc::now();
        {
            let mut inner = scheduler.inner.lock().unwrap();
            inner.cron_jobs.get_mut(&job.id).unwrap().0.next_fire_at = Some(now);
        }
        scheduler.tick(now);
        {
            let mut inner = scheduler.inner.lock().unwrap();
            inner.cron_jobs.get_mut(&job.id).unwrap().0.next_fire_at = Some(now);
        }
        scheduler.tick(now);

        let jobs = scheduler.list_cron_jobs();
        assert_eq!(jobs[0].fire_count, 2);
    }
}
