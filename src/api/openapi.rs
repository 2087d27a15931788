//! `GET /openapi.json` — a hand-built, minimal OpenAPI document covering
//! the REST surface. Not generated from the route table: the donor repo
//! has no OpenAPI tooling in its stack, so this follows the same
//! hand-authored-JSON approach used elsewhere (e.g. `capabilities.json`
//! in the subprocess supervisor) rather than pulling in a schema-gen crate.

use axum::Json;
use serde_json::{json, Value};

pub async fn spec() -> Json<Value> {
    Json(json!({
        "openapi": "3.0.3",
        "info": { "title": "aether-kernel", "version": super::API_VERSION },
        "paths": {
            "/agents": { "get": {}, "post": {} },
            "/agents/{pid}": { "get": {}, "delete": {} },
            "/agents/{pid}/pause": { "post": {} },
            "/agents/{pid}/resume": { "post": {} },
            "/agents/{pid}/signal": { "post": {} },
            "/agents/{pid}/messages": { "get": {}, "post": {} },
            "/agents/{pid}/output": { "get": {} },
            "/agents/{pid}/input": { "post": {} },
            "/agents/{pid}/timeline": { "get": {} },
            "/fs/{uid}/files": { "get": {}, "put": {}, "delete": {} },
            "/fs/{uid}/dir": { "get": {}, "post": {} },
            "/fs/{uid}/stat": { "get": {} },
            "/skills": { "get": {}, "post": {} },
            "/skills/run": { "post": {} },
            "/skills/{id}": { "get": {}, "delete": {} },
            "/skills/{id}/execute": { "post": {} },
            "/cron": { "get": {}, "post": {} },
            "/cron/{id}": { "delete": {} },
            "/cron/{id}/enabled": { "post": {} },
            "/triggers": { "get": {}, "post": {} },
            "/triggers/{name}": { "delete": {} },
            "/webhooks": { "get": {}, "post": {} },
            "/webhooks/{id}": { "delete": {} },
            "/webhooks/{id}/enable": { "post": {} },
            "/webhooks/{id}/disable": { "post": {} },
            "/webhooks/{id}/logs": { "get": {} },
            "/webhooks/dlq": { "get": {}, "delete": {} },
            "/webhooks/dlq/{id}/retry": { "post": {} },
            "/webhooks/dlq/{id}": { "delete": {} },
            "/webhooks/inbound": { "get": {}, "post": {} },
            "/hooks/{token}": { "post": {} },
            "/events": { "get": {} },
            "/ws": { "get": {} },
            "/system/status": { "get": {} },
            "/system/metrics": { "get": {} },
        },
    }))
}
