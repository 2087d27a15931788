//! `GET /events?filter=pattern` — server-sent events over the kernel's bus,
//! filtered client-side by the same wildcard pattern matcher the scheduler
//! and webhook engine use.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;

use crate::kernel::event_bus::matches_pattern;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_filter")]
    filter: String,
}

fn default_filter() -> String {
    "*".to_string()
}

pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.kernel.bus.subscribe();
    let filter = query.filter;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if matches_pattern(&filter, &event.kind) {
                        let payload = serde_json::to_string(&event).unwrap_or_default();
                        yield Ok(SseEvent::default().event(event.kind.clone()).data(payload));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
