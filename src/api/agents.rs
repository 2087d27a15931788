//! `/agents` — spawn, inspect, and control kernel-managed agent processes.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::kernel::audit::AuditQuery;
use crate::kernel::process::{IpcMessage, Process, Signal, SpawnConfig, KERNEL_PID};

use super::{ok, ok_page, AppState, Envelope};

fn parse_signal(raw: &str) -> Result<Signal, AppError> {
    match raw.to_uppercase().as_str() {
        "SIGTERM" => Ok(Signal::Sigterm),
        "SIGKILL" => Ok(Signal::Sigkill),
        "SIGSTOP" => Ok(Signal::Sigstop),
        "SIGCONT" => Ok(Signal::Sigcont),
        "SIGINT" => Ok(Signal::Sigint),
        _ => Err(AppError::InvalidInput(format!("unknown signal {raw}"))),
    }
}

pub async fn spawn(
    State(state): State<AppState>,
    Json(config): Json<SpawnConfig>,
) -> AppResult<Json<Envelope<Value>>> {
    let outcome = state
        .kernel
        .spawn_agent(config, KERNEL_PID)
        .await
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    if outcome.queued {
        return Err(AppError::Queued { position: outcome.queue_position.unwrap_or(0) });
    }
    Ok(Json(ok(serde_json::json!({ "pid": outcome.pid }))))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Envelope<Vec<Process>>>> {
    let all = state.kernel.processes.list();
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);
    let page: Vec<Process> = all.iter().skip(offset).take(limit).cloned().collect();
    Ok(Json(ok_page(page, all.len(), limit, offset)))
}

pub async fn get_one(State(state): State<AppState>, Path(pid): Path<u64>) -> AppResult<Json<Envelope<Process>>> {
    state
        .kernel
        .processes
        .get(pid)
        .map(ok)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no process with pid {pid}")))
}

pub async fn terminate(State(state): State<AppState>, Path(pid): Path<u64>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.processes.signal(pid, Signal::Sigterm) {
        return Err(AppError::NotFound(format!("no process with pid {pid}")));
    }
    state.kernel.subprocesses.stop(pid).await.ok();
    state.kernel.governor.unregister(pid);
    Ok(Json(ok(serde_json::json!({ "terminated": pid }))))
}

pub async fn pause(State(state): State<AppState>, Path(pid): Path<u64>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.processes.pause(pid) {
        return Err(AppError::InvalidInput(format!("pid {pid} cannot be paused from its current state")));
    }
    state.kernel.subprocesses.pause(pid).await.ok();
    Ok(Json(ok(serde_json::json!({ "paused": pid }))))
}

pub async fn resume(State(state): State<AppState>, Path(pid): Path<u64>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.processes.resume(pid) {
        return Err(AppError::InvalidInput(format!("pid {pid} cannot be resumed from its current state")));
    }
    state.kernel.subprocesses.resume(pid).await.ok();
    Ok(Json(ok(serde_json::json!({ "resumed": pid }))))
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal: String,
}

pub async fn signal(
    State(state): State<AppState>,
    Path(pid): Path<u64>,
    Json(req): Json<SignalRequest>,
) -> AppResult<Json<Envelope<Value>>> {
    let signal = parse_signal(&req.signal)?;
    if !state.kernel.processes.signal(pid, signal) {
        return Err(AppError::NotFound(format!("no process with pid {pid}")));
    }
    Ok(Json(ok(serde_json::json!({ "signaled": pid }))))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub to_pid: u64,
    pub channel: String,
    pub payload: Value,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(pid): Path<u64>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<Json<Envelope<IpcMessage>>> {
    let message = state
        .kernel
        .processes
        .send_message(pid, req.to_pid, &req.channel, req.payload)
        .map_err(AppError::InvalidInput)?;
    Ok(Json(ok(message)))
}

pub async fn inbox(State(state): State<AppState>, Path(pid): Path<u64>) -> Json<Envelope<Vec<IpcMessage>>> {
    Json(ok(state.kernel.processes.drain(pid)))
}

pub async fn output(State(state): State<AppState>, Path(pid): Path<u64>) -> AppResult<Json<Envelope<Value>>> {
    let output = state
        .kernel
        .subprocesses
        .get_output(pid)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(ok(serde_json::json!({ "stdout": output.stdout, "stderr": output.stderr }))))
}

#[derive(Debug, Deserialize)]
pub struct SendInputRequest {
    pub text: String,
}

pub async fn send_input(
    State(state): State<AppState>,
    Path(pid): Path<u64>,
    Json(req): Json<SendInputRequest>,
) -> AppResult<Json<Envelope<Value>>> {
    state
        .kernel
        .subprocesses
        .send_input(pid, &req.text)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(ok(serde_json::json!({ "sent": true }))))
}

/// Derived view joining the audit log and the process's own state: every
/// audit row naming this PID, oldest first. Not separately stored — this
/// endpoint is a read-only projection, per the audit/process data already
/// captured elsewhere.
pub async fn timeline(State(state): State<AppState>, Path(pid): Path<u64>) -> AppResult<Json<Envelope<Value>>> {
    let process = state
        .kernel
        .processes
        .get(pid)
        .ok_or_else(|| AppError::NotFound(format!("no process with pid {pid}")))?;

    let (mut related, _total) = state.kernel.audit.query(AuditQuery::default().pid(pid), 10_000, 0);
    related.sort_by_key(|e| e.created_at);

    Ok(Json(ok(serde_json::json!({
        "process": process,
        "events": related,
    }))))
}
