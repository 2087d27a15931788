//! `/cron` — cron job CRUD over the scheduler.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::kernel::scheduler::CronJob;

use super::{ok, AppState, Envelope};

pub async fn list(State(state): State<AppState>) -> Json<Envelope<Vec<CronJob>>> {
    Json(ok(state.kernel.scheduler.list_cron_jobs()))
}

#[derive(Debug, Deserialize)]
pub struct CreateCronRequest {
    pub name: String,
    pub expression: String,
    pub spawn_config: Value,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateCronRequest>,
) -> AppResult<Json<Envelope<CronJob>>> {
    let job = state
        .kernel
        .scheduler
        .add_cron_job(req.name, req.expression, req.spawn_config)
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    Ok(Json(ok(job)))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.scheduler.remove_cron_job(&id) {
        return Err(AppError::NotFound(format!("no cron job {id}")));
    }
    Ok(Json(ok(serde_json::json!({ "removed": id }))))
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

pub async fn set_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetEnabledRequest>,
) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.scheduler.set_cron_enabled(&id, req.enabled) {
        return Err(AppError::NotFound(format!("no cron job {id}")));
    }
    Ok(Json(ok(serde_json::json!({ "id": id, "enabled": req.enabled }))))
}
