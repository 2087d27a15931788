//! Component J — the audit log.
//!
//! An append-only record of tool invocations, auth events, and admin
//! actions, kept in memory with time-based retention pruning. Sensitive
//! fields are redacted before a row is ever stored — there is no
//! "unredacted" variant to accidentally expose later. Also subscribes to
//! the event bus directly so process/resource/workspace lifecycle events
//! show up in the audit trail without every other subsystem having to call
//! into this one explicitly.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::event_bus::{Event, EventBus};
use crate::config::AuditConfig;

const REDACTED_KEYS: &[&str] =
    &["password", "token", "apikey", "api_key", "secret", "credentials", "authorization"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ToolInvocation,
    AuthEvent,
    AdminAction,
    LifecycleEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: String,
    pub kind: AuditKind,
    pub actor: String,
    /// The acting process, when the action originated from one — unset for
    /// kernel-initiated rows (`observe`'s lifecycle mirroring) and external
    /// actors addressed only by `actor`.
    pub actor_pid: Option<u64>,
    pub actor_uid: Option<String>,
    pub action: String,
    /// What the action was performed on — a path, a PID, a webhook id, a
    /// trigger name. `None` when the action has no single target (e.g. a
    /// listing).
    pub target: Option<String>,
    pub detail: Value,
    pub result_hash: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Recursively redacts any object key matching (case-insensitively) one of
/// [`REDACTED_KEYS`], replacing its value with `"[REDACTED]"`.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if REDACTED_KEYS.contains(&k.to_lowercase().as_str()) {
                    out.insert(k.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    out.insert(k.clone(), sanitize(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// A hash of the first 1000 characters of a stringified result, so the
/// audit log can assert "this ran and produced X" without storing
/// potentially large or sensitive output verbatim. `None` for a nullish
/// result (nothing ran, or the action produced no output).
pub fn result_hash(result: &Value) -> Option<String> {
    if result.is_null() {
        return None;
    }
    let rendered = result.to_string();
    let truncated: String = rendered.chars().take(1000).collect();
    let mut hasher = Sha256::new();
    hasher.update(truncated.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    config: AuditConfig,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self { entries: Mutex::new(Vec::new()), config }
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &self,
        kind: AuditKind,
        actor: &str,
        actor_pid: Option<u64>,
        actor_uid: Option<&str>,
        action: &str,
        target: Option<&str>,
        detail: Value,
        result: Option<&Value>,
        metadata: Value,
    ) {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            actor: actor.to_string(),
            actor_pid,
            actor_uid: actor_uid.map(str::to_string),
            action: action.to_string(),
            target: target.map(str::to_string),
            detail: sanitize(&detail),
            result_hash: result.and_then(result_hash),
            metadata: sanitize(&metadata),
            created_at: Utc::now(),
        };
        self.entries.lock().unwrap().push(entry);
    }

    pub fn log_tool_invocation(
        &self,
        actor: &str,
        actor_pid: Option<u64>,
        tool: &str,
        target: Option<&str>,
        input: Value,
        result: &Value,
    ) {
        self.push(AuditKind::ToolInvocation, actor, actor_pid, None, tool, target, input, Some(result), Value::Null);
    }

    pub fn log_auth_event(&self, actor: &str, actor_uid: Option<&str>, action: &str, detail: Value) {
        self.push(AuditKind::AuthEvent, actor, None, actor_uid, action, None, detail, None, Value::Null);
    }

    pub fn log_admin_action(&self, actor: &str, actor_pid: Option<u64>, action: &str, target: Option<&str>, detail: Value) {
        self.push(AuditKind::AdminAction, actor, actor_pid, None, action, target, detail, None, Value::Null);
    }

    /// Maps a bus event onto an audit row when it belongs to one of the
    /// kinds this log mirrors automatically (process/resource/workspace
    /// lifecycle); other kinds are ignored so the audit trail doesn't
    /// balloon with high-frequency chatter like `subprocess.output`.
    pub fn observe(&self, event: &Event) {
        let auto_logged = event.kind.starts_with("process.")
            || event.kind.starts_with("resource.")
            || event.kind.starts_with("workspace.");
        if !auto_logged {
            return;
        }
        let actor_pid = event.payload.get("pid").and_then(Value::as_u64);
        self.push(AuditKind::LifecycleEvent, "kernel", actor_pid, None, &event.kind, None, event.payload.clone(), None, Value::Null);
    }

    /// Spawns a background task that forwards matching bus events into the
    /// audit log for the lifetime of `bus`.
    pub fn spawn_bus_subscriber(log: std::sync::Arc<Self>, bus: EventBus) {
        tokio::spawn(async move {
            let mut rx = bus.subscribe();
            while let Ok(event) = rx.recv().await {
                log.observe(&event);
            }
        });
    }

    pub fn prune_expired(&self) -> usize {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        before - entries.len()
    }

    /// Paginated query, newest first, filtered by whichever of
    /// [`AuditQuery`]'s fields are set (actor, kind, PID, action, and a
    /// `[since, until)` time range).
    pub fn query(&self, filter: AuditQuery, limit: usize, offset: usize) -> (Vec<AuditEntry>, usize) {
        let entries = self.entries.lock().unwrap();
        let mut filtered: Vec<AuditEntry> = entries
            .iter()
            .rev()
            .filter(|e| filter.actor.as_deref().map(|a| e.actor == a).unwrap_or(true))
            .filter(|e| filter.kind.map(|k| e.kind == k).unwrap_or(true))
            .filter(|e| filter.pid.map(|p| e.actor_pid == Some(p)).unwrap_or(true))
            .filter(|e| filter.action.as_deref().map(|a| e.action == a).unwrap_or(true))
            .filter(|e| filter.since.map(|s| e.created_at >= s).unwrap_or(true))
            .filter(|e| filter.until.map(|u| e.created_at < u).unwrap_or(true))
            .cloned()
            .collect();
        let total = filtered.len();
        let page: Vec<AuditEntry> = filtered.drain(..).skip(offset).take(limit).collect();
        (page, total)
    }
}

/// §4.8: query supports filtering by actor, PID, action, event_type (kind),
/// and a time range. Every field defaults to "no filter".
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub kind: Option<AuditKind>,
    pub pid: Option<u64>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn kind(mut self, kind: AuditKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn pid(mut self, pid: u64) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_redacts_known_keys_case_insensitively() {
        let input = serde_json::json!({ "user": "alice", "Password": "hunter2", "nested": { "API_KEY": "xyz" } });
        let out = sanitize(&input);
        assert_eq!(out["Password"], "[REDACTED]");
        assert_eq!(out["nested"]["API_KEY"], "[REDACTED]");
        assert_eq!(out["user"], "alice");
    }

    #[test]
    fn result_hash_is_none_for_null() {
        assert!(result_hash(&Value::Null).is_none());
    }

    #[test]
    fn result_hash_is_stable() {
        let a = result_hash(&serde_json::json!({ "x": 1 })).unwrap();
        let b = result_hash(&serde_json::json!({ "x": 1 })).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn log_and_query_round_trip() {
        let log = AuditLog::new(AuditConfig { retention_days: 30 });
        log.log_tool_invocation(
            "agent_1",
            Some(1),
            "fs.write",
            Some("/x"),
            serde_json::json!({"path": "/x"}),
            &serde_json::json!({"ok": true}),
        );
        log.log_auth_event("agent_1", Some("uid-1"), "login", serde_json::json!({ "token": "shh" }));
        let (page, total) = log.query(AuditQuery::default().actor("agent_1"), 10, 0);
        assert_eq!(total, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].action, "login");
        assert_eq!(page[0].detail["token"], "[REDACTED]");
        assert_eq!(page[0].actor_uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn query_filters_by_kind() {
        let log = AuditLog::new(AuditConfig { retention_days: 30 });
        log.log_admin_action("root", None, "ban_agent", Some("agent_1"), serde_json::json!({}));
        log.log_auth_event("root", None, "login", serde_json::json!({}));
        let (page, total) = log.query(AuditQuery::default().kind(AuditKind::AdminAction), 10, 0);
        assert_eq!(total, 1);
        assert_eq!(page[0].action, "ban_agent");
        assert_eq!(page[0].target.as_deref(), Some("agent_1"));
    }

    #[test]
    fn query_filters_by_pid_and_action() {
        let log = AuditLog::new(AuditConfig { retention_days: 30 });
        log.log_tool_invocation("agent_1", Some(7), "fs.read", None, serde_json::json!({}), &serde_json::json!({}));
        log.log_tool_invocation("agent_2", Some(8), "fs.read", None, serde_json::json!({}), &serde_json::json!({}));

        let (page, total) = log.query(AuditQuery::default().pid(7), 10, 0);
        assert_eq!(total, 1);
        assert_eq!(page[0].actor, "agent_1");

        let (_, total) = log.query(AuditQuery::default().action("fs.read"), 10, 0);
        assert_eq!(total, 2);
    }

    #[test]
    fn query_filters_by_time_range() {
        let log = AuditLog::new(AuditConfig { retention_days: 30 });
        log.log_auth_event("a", None, "login", serde_json::json!({}));
        let now = Utc::now();
        let (_, in_range) =
            log.query(AuditQuery::default().between(now - Duration::minutes(1), now + Duration::minutes(1)), 10, 0);
        assert_eq!(in_range, 1);
        let (_, out_of_range) =
            log.query(AuditQuery::default().between(now + Duration::minutes(1), now + Duration::minutes(2)), 10, 0);
        assert_eq!(out_of_range, 0);
    }

    #[test]
    fn observe_ignores_unmapped_event_kinds() {
        let log = AuditLog::new(AuditConfig { retention_days: 30 });
        log.observe(&Event::new("subprocess.output", serde_json::json!({})));
        let (_, total) = log.query(AuditQuery::default(), 10, 0);
        assert_eq!(total, 0);
    }

    #[test]
    fn observe_maps_lifecycle_events_and_captures_pid() {
        let log = AuditLog::new(AuditConfig { retention_days: 30 });
        log.observe(&Event::new("process.spawned", serde_json::json!({ "pid": 1 })));
        let (page, total) = log.query(AuditQuery::default().kind(AuditKind::LifecycleEvent), 10, 0);
        assert_eq!(total, 1);
        assert_eq!(page[0].action, "process.spawned");
        assert_eq!(page[0].actor_pid, Some(1));
    }
}
