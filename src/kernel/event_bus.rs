//! Component A — the event bus.
//!
//! An in-process pub/sub with wildcard subscriptions. Every event carries a
//! common header (dot-namespaced `kind`, UTC `timestamp`) and an arbitrary
//! JSON `payload` — the "tagged envelope" from the design notes, since the
//! kernel's event vocabulary is open-ended (new kinds are added by every
//! subsystem) and subscribers select by pattern, not by Rust type.
//!
//! Ordering: events from a single publishing task are delivered to every
//! subscriber in publish order, because all publishing goes through one
//! `tokio::sync::broadcast` channel and broadcast preserves sender order.
//! Interleaving across different publishing tasks is unspecified, per §5.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default channel capacity. Slow subscribers fall behind and see
/// `RecvError::Lagged`, which callers treat as "skip forward", never as
/// a hard failure — the bus has no persistence or replay guarantee.
const CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// `*` matches everything; `prefix.*` matches any `prefix.X` (single extra
/// segment or more — matching is a textual prefix check after stripping the
/// trailing `*`); anything else must match the event kind exactly.
pub fn matches_pattern(pattern: &str, kind: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return kind == prefix || kind.starts_with(&format!("{prefix}."));
    }
    pattern == kind
}

/// Returns true if `kind` matches any pattern in `patterns`.
pub fn matches_any(patterns: &[String], kind: &str) -> bool {
    patterns.iter().any(|p| matches_pattern(p, kind))
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event to every current subscriber. Never blocks; a bus
    /// with zero subscribers simply drops the event (matches
    /// `broadcast::Sender::send`'s semantics, which only errors when there
    /// are no receivers at all — the kernel treats that as a no-op, not a
    /// failure, since nothing is meant to observe every event).
    pub fn publish(&self, kind: impl Into<String>, payload: serde_json::Value) {
        let event = Event::new(kind, payload);
        tracing::debug!(kind = %event.kind, "bus.publish");
        let _ = self.sender.send(event);
    }

    pub fn publish_event(&self, event: Event) {
        tracing::debug!(kind = %event.kind, "bus.publish");
        let _ = self.sender.send(event);
    }

    /// Raw subscription: every event, unfiltered. Subscribers that only
    /// care about a subset of kinds filter client-side with
    /// [`matches_pattern`] / [`matches_any`] — this mirrors how the
    /// scheduler and webhook engine are specified to work (enumerate rules,
    /// test each against the incoming event).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches_pattern("process.spawned", "process.spawned"));
        assert!(!matches_pattern("process.spawned", "process.exit"));
    }

    #[test]
    fn wildcard_match() {
        assert!(matches_pattern("*", "anything.at.all"));
    }

    #[test]
    fn prefix_wildcard_match() {
        assert!(matches_pattern("process.*", "process.spawned"));
        assert!(matches_pattern("process.*", "process.exit"));
        assert!(!matches_pattern("process.*", "webhook.fired"));
        assert!(!matches_pattern("process.*", "processing.started"));
    }

    #[tokio::test]
    async fn publish_subscribe_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish("a.one", serde_json::json!({}));
        bus.publish("a.two", serde_json::json!({}));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, "a.one");
        assert_eq!(second.kind, "a.two");
    }

    #[tokio::test]
    async fn no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish("nobody.listening", serde_json::json!({}));
    }
}
