//! `/triggers` — event-trigger CRUD over the scheduler.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::kernel::scheduler::EventTrigger;

use super::{ok, AppState, Envelope};

pub async fn list(State(state): State<AppState>) -> Json<Envelope<Vec<EventTrigger>>> {
    Json(ok(state.kernel.scheduler.list_triggers()))
}

#[derive(Debug, Deserialize)]
pub struct CreateTriggerRequest {
    pub name: String,
    pub event_pattern: String,
    #[serde(default)]
    pub filter: Option<Value>,
    pub spawn_config: Value,
    #[serde(default)]
    pub cooldown_ms: u64,
}

pub async fn create(State(state): State<AppState>, Json(req): Json<CreateTriggerRequest>) -> Json<Envelope<Value>> {
    let trigger = state.kernel.scheduler.add_trigger(EventTrigger {
        id: String::new(),
        name: req.name,
        event_pattern: req.event_pattern,
        filter: req.filter,
        spawn_config: req.spawn_config,
        enabled: true,
        cooldown_ms: req.cooldown_ms,
        last_fired_at: None,
        fire_count: 0,
    });
    Json(ok(serde_json::json!({ "id": trigger.id, "name": trigger.name })))
}

pub async fn remove(State(state): State<AppState>, Path(name): Path<String>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.scheduler.remove_trigger(&name) {
        return Err(AppError::NotFound(format!("no trigger named {name}")));
    }
    Ok(Json(ok(serde_json::json!({ "removed": name }))))
}
