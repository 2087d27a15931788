//! `/system/status`, `/system/metrics`, `/healthz` — pure read models, no
//! storage of their own: every field is a projection over what other
//! managers already track.

use axum::extract::State;
use axum::Json;
use serde_json::Value;

use super::{ok, AppState, Envelope};

pub async fn health_check() -> Json<Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

pub async fn status(State(state): State<AppState>) -> Json<Envelope<Value>> {
    let processes = state.kernel.processes.list();
    let running = processes.iter().filter(|p| p.state == crate::kernel::process::ProcessState::Running).count();
    Json(ok(serde_json::json!({
        "active_processes": state.kernel.processes.active_len(),
        "running": running,
        "queued": state.kernel.processes.queue_len(),
        "total_tracked": processes.len(),
        "ws_connections": "see /system/metrics",
    })))
}

pub async fn metrics(State(state): State<AppState>) -> Json<Envelope<Value>> {
    let subscriptions = state.kernel.webhooks.list_subscriptions().len();
    let dlq_depth = state.kernel.webhooks.dead_letters().len();
    let cron_jobs = state.kernel.scheduler.list_cron_jobs().len();
    let triggers = state.kernel.scheduler.list_triggers().len();
    let bus_subscribers = state.kernel.bus.subscriber_count();
    Json(ok(serde_json::json!({
        "webhook_subscriptions": subscriptions,
        "webhook_dlq_depth": dlq_depth,
        "cron_jobs": cron_jobs,
        "event_triggers": triggers,
        "bus_subscribers": bus_subscribers,
    })))
}
