//! `/skills` — register declarative pipelines and run them.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::kernel::skill::{SkillDefinition, SkillRunResult};

use super::{ok, AppState, Envelope};

pub async fn register(
    State(state): State<AppState>,
    Json(skill): Json<SkillDefinition>,
) -> AppResult<Json<Envelope<SkillDefinition>>> {
    state
        .kernel
        .skills
        .register(skill.clone())
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    Ok(Json(ok(skill)))
}

pub async fn list(State(state): State<AppState>) -> Json<Envelope<Vec<SkillDefinition>>> {
    Json(ok(state.kernel.skills.list()))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Envelope<SkillDefinition>>> {
    state
        .kernel
        .skills
        .get(&id)
        .map(|s| Json(ok(s)))
        .ok_or_else(|| AppError::NotFound(format!("no skill named {id}")))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<bool>>> {
    Ok(Json(ok(state.kernel.skills.unregister(&id))))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub inputs: serde_json::Value,
}

pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecuteRequest>,
) -> AppResult<Json<Envelope<SkillRunResult>>> {
    let result = state
        .kernel
        .skills
        .execute(&id, body.inputs)
        .await
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    Ok(Json(ok(result)))
}

/// Runs an ad-hoc, unregistered skill definition synchronously — used for
/// one-off pipelines that don't need to be persisted first.
pub async fn run(
    State(state): State<AppState>,
    Json(skill): Json<SkillDefinition>,
) -> AppResult<Json<Envelope<SkillRunResult>>> {
    let result = state.kernel.skills.run(&skill).await;
    Ok(Json(ok(result)))
}
