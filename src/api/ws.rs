//! `GET /ws` — the bidirectional command/event WebSocket. Mirrors the
//! donor's `WebSocketTransport::handle_socket`: split the socket, pump a
//! send task off an `mpsc` channel, pump a receive task off the read half,
//! `tokio::select!` on whichever finishes first, clean up on exit. Every
//! inbound command carries a correlation `id`, echoed back on
//! `response.ok`/`response.error` so a client can match replies to
//! requests without serializing its own command stream.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::kernel::ws_fanout::ConnectionSink;

use super::AppState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct Command {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Value,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut outbound_rx) = ConnectionSink::new(state.kernel.config.ws);
    let sink = Arc::new(sink);

    state.kernel.ws_fanout.register(sink.clone()).await;
    let flush_handle = sink.clone().spawn_flush_timer();

    let send_handle = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let receive_state = state.clone();
    let receive_handle = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    dispatch_command(&receive_state, &text).await;
                }
                Message::Close(_) => {
                    info!("ws client disconnected");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_handle => {},
        _ = receive_handle => {},
    }

    flush_handle.abort();
    state.kernel.ws_fanout.unregister(&sink).await;
}

async fn dispatch_command(state: &AppState, text: &str) {
    let command: Command = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            error!("invalid ws command: {e}");
            state.kernel.bus.publish(
                "response.error",
                serde_json::json!({ "id": Value::Null, "error": { "code": "INVALID_INPUT", "message": e.to_string() } }),
            );
            return;
        }
    };

    let result = match command.kind.as_str() {
        "agents.list" => Ok(serde_json::to_value(state.kernel.processes.list()).unwrap_or_default()),
        "agents.spawn" => spawn_via_ws(state, command.params).await,
        "system.status" => Ok(serde_json::json!({
            "active_processes": state.kernel.processes.active_len(),
            "queued": state.kernel.processes.queue_len(),
        })),
        other => Err(format!("unknown command type: {other}")),
    };

    match result {
        Ok(data) => state.kernel.bus.publish(
            "response.ok",
            serde_json::json!({ "id": command.id, "data": data }),
        ),
        Err(message) => state.kernel.bus.publish(
            "response.error",
            serde_json::json!({ "id": command.id, "error": { "code": "EXECUTION_ERROR", "message": message } }),
        ),
    }
}

async fn spawn_via_ws(state: &AppState, params: Value) -> Result<Value, String> {
    let config: crate::kernel::process::SpawnConfig =
        serde_json::from_value(params).map_err(|e| e.to_string())?;
    let outcome = state
        .kernel
        .spawn_agent(config, crate::kernel::process::KERNEL_PID)
        .await
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "pid": outcome.pid, "queued": outcome.queued }))
}
