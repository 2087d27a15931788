//! Component K — WebSocket event fan-out.
//!
//! Each connection gets a [`ConnectionSink`]: events are buffered and
//! flushed as a single JSON batch either when the batch fills up or a short
//! timer elapses, so a burst of chatty subprocess output doesn't turn into
//! one WebSocket frame per line. A hard cap on queued events protects a
//! slow/stalled client from growing its buffer unbounded; once over the
//! cap, non-critical events are dropped first (critical ones — responses
//! and readiness/listing events a client is actively waiting on — are only
//! dropped if literally everything queued is critical).

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::event_bus::Event;
use crate::config::WsFanoutConfig;

/// Events a client is plausibly blocked on and shouldn't silently lose.
fn is_critical(kind: &str) -> bool {
    matches!(kind, "response.ok" | "response.error" | "kernel.ready" | "process.list")
}

struct Buffer {
    queue: VecDeque<Value>,
}

impl Buffer {
    fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    fn push(&mut self, event: Value, kind: &str, max_queued: usize) {
        if self.queue.len() >= max_queued {
            let drop_idx = self
                .queue
                .iter()
                .position(|e| !is_critical(e.get("kind").and_then(Value::as_str).unwrap_or("")))
                .unwrap_or(0);
            self.queue.remove(drop_idx);
        }
        let _ = kind;
        self.queue.push_back(event);
    }

    fn drain_batch(&mut self, max_size: usize) -> Vec<Value> {
        let n = self.queue.len().min(max_size);
        self.queue.drain(..n).collect()
    }
}

/// Per-connection handle; `feed` is called from the bus-forwarding task,
/// `outbound` is the channel the WebSocket write-loop drains frames from.
pub struct ConnectionSink {
    buffer: Arc<Mutex<Buffer>>,
    outbound: mpsc::Sender<String>,
    config: WsFanoutConfig,
}

impl ConnectionSink {
    pub fn new(config: WsFanoutConfig) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(config.max_queued_events.max(1));
        (Self { buffer: Arc::new(Mutex::new(Buffer::new())), outbound: tx, config }, rx)
    }

    /// Queues an event for this connection. Congestion-aware: when the
    /// outbound channel itself is near full (the write side can't keep up
    /// with flushes), non-critical events are dropped at the door instead
    /// of being buffered only to be evicted later.
    pub async fn feed(&self, event: &Event) {
        let congested = self.outbound.capacity() == 0;
        if congested && !is_critical(&event.kind) {
            return;
        }
        let payload = serde_json::json!({ "kind": event.kind, "timestamp": event.timestamp, "payload": event.payload });
        let mut buffer = self.buffer.lock().await;
        buffer.push(payload, &event.kind, self.config.max_queued_events);
        if buffer.queue.len() >= self.config.batch_max_size {
            let batch = buffer.drain_batch(self.config.batch_max_size);
            drop(buffer);
            self.flush_batch(batch).await;
        }
    }

    async fn flush_batch(&self, batch: Vec<Value>) {
        if batch.is_empty() {
            return;
        }
        let frame = serde_json::to_string(&serde_json::json!({ "type": "event_batch", "events": batch }))
            .unwrap_or_default();
        let _ = self.outbound.send(frame).await;
    }

    /// Called periodically (every `flush_interval`) to flush whatever has
    /// accumulated below the immediate-flush threshold.
    pub async fn flush_pending(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain_batch(self.config.batch_max_size)
        };
        self.flush_batch(batch).await;
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        self.config.flush_interval
    }

    /// Spawns the background flush timer; returns a handle the caller can
    /// abort on disconnect.
    pub fn spawn_flush_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.flush_pending().await;
            }
        })
    }
}

/// Fans a bus event out to every currently-registered connection sink.
pub struct WsFanout {
    sinks: Mutex<Vec<Arc<ConnectionSink>>>,
}

impl Default for WsFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl WsFanout {
    pub fn new() -> Self {
        Self { sinks: Mutex::new(Vec::new()) }
    }

    pub async fn register(&self, sink: Arc<ConnectionSink>) {
        self.sinks.lock().await.push(sink);
    }

    pub async fn unregister(&self, sink: &Arc<ConnectionSink>) {
        let mut sinks = self.sinks.lock().await;
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
    }

    pub async fn broadcast(&self, event: &Event) {
        let sinks = self.sinks.lock().await.clone();
        for sink in sinks {
            sink.feed(event).await;
        }
    }
}
