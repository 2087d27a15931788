//! The HTTP/SSE/WebSocket surface. Every handler takes `State<AppState>`
//! (a thin `Arc`-cloneable wrapper around the [`Kernel`]) the same way the
//! donor's handlers take `State<AppState>` wrapping a `PgPool` — swap the
//! resource, keep the shape.

pub mod agents;
pub mod cron;
pub mod events;
pub mod fs;
pub mod openapi;
pub mod skills;
pub mod system;
pub mod triggers;
pub mod webhooks;
pub mod ws;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::Kernel;

pub const API_VERSION: &str = "1.0";

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
}

/// `{data: ..., meta?: {total, limit, offset}}` success envelope, per the
/// REST contract every endpoint here follows.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<PageMeta>,
}

#[derive(Debug, Serialize)]
pub struct PageMeta {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

pub fn ok<T: Serialize>(data: T) -> Envelope<T> {
    Envelope { data, meta: None }
}

pub fn ok_page<T: Serialize>(data: T, total: usize, limit: usize, offset: usize) -> Envelope<T> {
    Envelope { data, meta: Some(PageMeta { total, limit, offset }) }
}

async fn stamp_version(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("X-Aether-Version", HeaderValue::from_static(API_VERSION));
    response
}

pub fn router(kernel: Arc<Kernel>) -> Router {
    let state = AppState { kernel };

    Router::new()
        .route("/healthz", get(system::health_check))
        .route("/system/status", get(system::status))
        .route("/system/metrics", get(system::metrics))
        .route("/openapi.json", get(openapi::spec))
        .route("/events", get(events::stream))
        .route("/ws", get(ws::upgrade))
        .route("/agents", post(agents::spawn).get(agents::list))
        .route(
            "/agents/:pid",
            get(agents::get_one).delete(agents::terminate),
        )
        .route("/agents/:pid/pause", post(agents::pause))
        .route("/agents/:pid/resume", post(agents::resume))
        .route("/agents/:pid/signal", post(agents::signal))
        .route("/agents/:pid/messages", post(agents::send_message).get(agents::inbox))
        .route("/agents/:pid/output", get(agents::output))
        .route("/agents/:pid/input", post(agents::send_input))
        .route("/agents/:pid/timeline", get(agents::timeline))
        .route("/fs/:uid/files", get(fs::read_file).put(fs::write_file).delete(fs::remove))
        .route("/fs/:uid/raw", get(fs::read_raw))
        .route("/fs/:uid/dir", get(fs::list_dir).post(fs::make_dir))
        .route("/fs/:uid/stat", get(fs::stat))
        .route("/skills", get(skills::list).post(skills::register))
        .route("/skills/run", post(skills::run))
        .route("/skills/:id", get(skills::get_one).delete(skills::remove))
        .route("/skills/:id/execute", post(skills::execute))
        .route("/cron", get(cron::list).post(cron::create))
        .route("/cron/:id", delete(cron::remove))
        .route("/cron/:id/enabled", post(cron::set_enabled))
        .route("/triggers", get(triggers::list).post(triggers::create))
        .route("/triggers/:name", delete(triggers::remove))
        .route("/webhooks", get(webhooks::list).post(webhooks::subscribe))
        .route("/webhooks/:id", delete(webhooks::unsubscribe))
        .route("/webhooks/:id/enable", post(webhooks::enable))
        .route("/webhooks/:id/disable", post(webhooks::disable))
        .route("/webhooks/:id/logs", get(webhooks::logs))
        .route("/webhooks/dlq", get(webhooks::dead_letters).delete(webhooks::purge_all))
        .route("/webhooks/dlq/:id/retry", post(webhooks::retry_one))
        .route("/webhooks/dlq/:id", delete(webhooks::purge_one))
        .route("/webhooks/inbound", get(webhooks::list_inbound).post(webhooks::create_inbound))
        .route("/hooks/:token", post(webhooks::trigger_inbound))
        .layer(middleware::from_fn(stamp_version))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
