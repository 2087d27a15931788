//! `/webhooks` — outbound subscription management, the dead-letter queue,
//! and inbound hook registration + dispatch.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::kernel::process::KERNEL_PID;
use crate::kernel::webhook::{
    generate_inbound_token, DeadLetter, DeliveryLogEntry, InboundWebhook, WebhookSubscription,
};

use super::{ok, AppState, Envelope};

pub async fn list(State(state): State<AppState>) -> Json<Envelope<Vec<WebhookSubscription>>> {
    Json(ok(state.kernel.webhooks.list_subscriptions()))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub name: String,
    pub url: String,
    pub event_patterns: Vec<String>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub extra_headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub retry_budget: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub async fn subscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Json<Envelope<WebhookSubscription>> {
    let sub = state.kernel.webhooks.subscribe(WebhookSubscription {
        id: String::new(),
        name: req.name,
        url: req.url,
        event_patterns: req.event_patterns,
        filter: req.filter,
        secret: req.secret,
        extra_headers: req.extra_headers,
        enabled: true,
        retry_budget: req.retry_budget.unwrap_or(2),
        timeout_ms: req.timeout_ms,
        failure_count: 0,
        last_triggered_at: None,
    });
    Json(ok(sub))
}

pub async fn unsubscribe(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.webhooks.unsubscribe(&id) {
        return Err(AppError::NotFound(format!("no webhook subscription {id}")));
    }
    Ok(Json(ok(serde_json::json!({ "removed": id }))))
}

pub async fn enable(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.webhooks.set_enabled(&id, true) {
        return Err(AppError::NotFound(format!("no webhook subscription {id}")));
    }
    Ok(Json(ok(serde_json::json!({ "enabled": id }))))
}

pub async fn disable(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.webhooks.set_enabled(&id, false) {
        return Err(AppError::NotFound(format!("no webhook subscription {id}")));
    }
    Ok(Json(ok(serde_json::json!({ "disabled": id }))))
}

pub async fn logs(State(state): State<AppState>, Path(id): Path<String>) -> Json<Envelope<Vec<DeliveryLogEntry>>> {
    Json(ok(state.kernel.webhooks.delivery_log(Some(&id))))
}

pub async fn dead_letters(State(state): State<AppState>) -> Json<Envelope<Vec<DeadLetter>>> {
    Json(ok(state.kernel.webhooks.dead_letters()))
}

pub async fn retry_one(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<Value>>> {
    state
        .kernel
        .webhooks
        .retry_dead_letter(&id)
        .await
        .map_err(AppError::NotFound)?;
    Ok(Json(ok(serde_json::json!({ "retried": id }))))
}

pub async fn purge_one(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<Value>>> {
    if !state.kernel.webhooks.purge_dead_letter(&id) {
        return Err(AppError::NotFound(format!("no dead letter {id}")));
    }
    Ok(Json(ok(serde_json::json!({ "purged": id }))))
}

pub async fn purge_all(State(state): State<AppState>) -> Json<Envelope<Value>> {
    let purged = state.kernel.webhooks.purge_all_dead_letters();
    Json(ok(serde_json::json!({ "purged_count": purged })))
}

#[derive(Debug, Deserialize)]
pub struct CreateInboundRequest {
    #[serde(default)]
    pub name: String,
    pub spawn_config: Value,
    #[serde(default)]
    pub payload_transform: Option<Value>,
    #[serde(default)]
    pub owner: String,
}

pub async fn list_inbound(State(state): State<AppState>) -> Json<Envelope<Vec<InboundWebhook>>> {
    Json(ok(state.kernel.webhooks.list_inbound()))
}

pub async fn create_inbound(
    State(state): State<AppState>,
    Json(req): Json<CreateInboundRequest>,
) -> Json<Envelope<InboundWebhook>> {
    let hook = InboundWebhook {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        token: generate_inbound_token(),
        spawn_config: req.spawn_config,
        payload_transform: req.payload_transform,
        enabled: true,
        owner: req.owner,
        trigger_count: 0,
    };
    state.kernel.webhooks.register_inbound(hook.clone());
    Json(ok(hook))
}

/// `POST /hooks/{token}` — inbound dispatch. Deliberately opaque per §6:
/// an unknown or disabled token gets the same empty `{}` an enabled one
/// would get on a spawn failure, so the endpoint never leaks which tokens
/// exist.
/// Callers may POST with no body at all (a bare ping) or an arbitrary JSON
/// payload the kernel ignores — an inbound hook's identity is the token,
/// not the body — so the body is read as raw bytes rather than through the
/// `Json` extractor, which would reject an empty or non-JSON request before
/// this handler ever ran.
pub async fn trigger_inbound(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Json<Envelope<Value>> {
    let _payload: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };

    let Some(hook) = state.kernel.webhooks.trigger_inbound(&token) else {
        return Json(ok(serde_json::json!({})));
    };

    let Ok(config) = serde_json::from_value(hook.spawn_config) else {
        return Json(ok(serde_json::json!({})));
    };
    let Ok(outcome) = state.kernel.spawn_agent(config, KERNEL_PID).await else {
        return Json(ok(serde_json::json!({})));
    };

    state.kernel.bus.publish(
        "webhook.inbound.triggered",
        serde_json::json!({ "inbound_id": hook.id, "pid": outcome.pid }),
    );
    Json(ok(serde_json::json!({ "pid": outcome.pid })))
}
