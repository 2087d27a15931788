//! Component I — the webhook engine.
//!
//! Outbound: every bus event not namespaced `webhook.*` (to avoid feedback
//! loops) is matched against registered subscriptions (glob-style event
//! patterns, optional JSON filter); matches are HMAC-signed and POSTed with
//! exponential backoff + jitter, landing in a dead-letter queue once
//! retries are exhausted. Inbound: an opaque token maps to a spawn
//! configuration, so a third party can kick off an agent via a plain HTTP
//! POST. Signing follows the same scheme as the donor's other webhook
//! consumers: `HMAC-SHA256` over the raw body, hex-encoded, sent as a
//! header — verified with `subtle::ConstantTimeEq` so a timing side
//! channel can't leak the signature byte-by-byte.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::event_bus::{matches_pattern, EventBus};
use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let expected = sign(secret, body);
    let (Ok(a), Ok(b)) = (hex::decode(&expected), hex::decode(signature_hex)) else {
        return false;
    };
    a.ct_eq(&b).into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    /// Glob-style event patterns this webhook subscribes to (`*`,
    /// `prefix.*`, or an exact kind) — §3 allows a list, not just one.
    pub event_patterns: Vec<String>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    pub enabled: bool,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
}

fn default_retry_budget() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryLogEntry {
    pub id: String,
    pub webhook_id: String,
    pub event_type: String,
    pub attempt: u32,
    pub status_code: Option<u16>,
    pub response_body: String,
    pub duration_ms: u64,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub webhook_id: String,
    pub event_type: String,
    pub payload: Value,
    pub final_error: String,
    pub total_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundWebhook {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub token: String,
    pub spawn_config: Value,
    #[serde(default)]
    pub payload_transform: Option<Value>,
    pub enabled: bool,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub trigger_count: u64,
}

/// A fresh 32-random-byte hex token for a new inbound webhook, per §3.
pub fn generate_inbound_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Truncates to at most `max_bytes`, backing off to the nearest preceding
/// char boundary so a multi-byte UTF-8 sequence is never split.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn filter_matches(filter: &Value, payload: &Value) -> bool {
    let (Some(f), Some(p)) = (filter.as_object(), payload.as_object()) else {
        return filter == payload;
    };
    f.iter().all(|(k, v)| p.get(k) == Some(v))
}

/// `delay(attempt) = min(base * 2^attempt, max) + uniform(0, 1000ms)`.
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(max);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    capped + Duration::from_millis(jitter_ms)
}

struct Inner {
    subscriptions: HashMap<String, WebhookSubscription>,
    inbound: HashMap<String, InboundWebhook>,
    log: Vec<DeliveryLogEntry>,
    dlq: Vec<DeadLetter>,
}

pub struct WebhookEngine {
    inner: Mutex<Inner>,
    config: WebhookConfig,
    client: reqwest::Client,
    bus: EventBus,
}

impl WebhookEngine {
    pub fn new(config: WebhookConfig, bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscriptions: HashMap::new(),
                inbound: HashMap::new(),
                log: Vec::new(),
                dlq: Vec::new(),
            }),
            client: reqwest::Client::new(),
            config,
            bus,
        }
    }

    pub fn subscribe(&self, mut sub: WebhookSubscription) -> WebhookSubscription {
        if sub.id.is_empty() {
            sub.id = uuid::Uuid::new_v4().to_string();
        }
        self.inner.lock().unwrap().subscriptions.insert(sub.id.clone(), sub.clone());
        sub
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.lock().unwrap().subscriptions.remove(id).is_some()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(id) {
            sub.enabled = enabled;
            true
        } else {
            false
        }
    }

    pub fn list_subscriptions(&self) -> Vec<WebhookSubscription> {
        self.inner.lock().unwrap().subscriptions.values().cloned().collect()
    }

    pub fn register_inbound(&self, hook: InboundWebhook) {
        self.inner.lock().unwrap().inbound.insert(hook.token.clone(), hook);
    }

    pub fn list_inbound(&self) -> Vec<InboundWebhook> {
        self.inner.lock().unwrap().inbound.values().cloned().collect()
    }

    /// Resolves a token to an enabled inbound hook and bumps its trigger
    /// count. Returns `None` for an unknown OR disabled token — §6 wants
    /// the two indistinguishable from the caller's perspective.
    pub fn trigger_inbound(&self, token: &str) -> Option<InboundWebhook> {
        let mut inner = self.inner.lock().unwrap();
        let hook = inner.inbound.get_mut(token)?;
        if !hook.enabled {
            return None;
        }
        hook.trigger_count += 1;
        Some(hook.clone())
    }

    fn matching_subscriptions(&self, kind: &str, payload: &Value) -> Vec<WebhookSubscription> {
        let inner = self.inner.lock().unwrap();
        inner
            .subscriptions
            .values()
            .filter(|s| s.enabled && s.event_patterns.iter().any(|p| matches_pattern(p, kind)))
            .filter(|s| s.filter.as_ref().map(|f| filter_matches(f, payload)).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Delivers `kind`/`payload` to every matching, enabled subscription,
    /// retrying each independently with exponential backoff; a subscription
    /// that exhausts its retry budget lands in the dead-letter queue
    /// instead of blocking delivery to the others. Skips `webhook.*` events
    /// itself so outbound delivery can never trigger another delivery.
    pub async fn deliver(&self, kind: &str, payload: &Value) {
        if kind.starts_with("webhook.") {
            return;
        }
        for sub in self.matching_subscriptions(kind, payload) {
            self.deliver_to(&sub, kind, payload).await;
        }
    }

    fn wire_body(sub_id: &str, kind: &str, payload: &Value) -> (Vec<u8>, DateTime<Utc>) {
        let timestamp = Utc::now();
        let envelope = serde_json::json!({
            "event": kind,
            "timestamp": timestamp,
            "webhookId": sub_id,
            "data": payload,
        });
        (serde_json::to_vec(&envelope).unwrap_or_default(), timestamp)
    }

    async fn deliver_to(&self, sub: &WebhookSubscription, kind: &str, payload: &Value) {
        let (body, _timestamp) = Self::wire_body(&sub.id, kind, payload);
        let timeout = sub
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);
        let max_attempts = sub.retry_budget + 1;

        let mut last_error = String::new();
        for attempt in 0..max_attempts {
            let started = Instant::now();
            let mut request = self
                .client
                .post(&sub.url)
                .timeout(timeout)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if let Some(secret) = &sub.secret {
                request = request.header("X-Aether-Signature", sign(secret, &body));
            }
            for (k, v) in &sub.extra_headers {
                request = request.header(k, v);
            }

            let result = request.send().await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let (status_code, success, response_body, error) = match result {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    (Some(status.as_u16()), status.is_success(), text, String::new())
                }
                Err(e) => (None, false, String::new(), e.to_string()),
            };

            self.record_log(sub, kind, attempt + 1, status_code, &response_body, duration_ms, success);

            if success {
                self.mark_triggered(&sub.id);
                self.bus.publish(
                    "webhook.delivery",
                    serde_json::json!({ "webhook_id": sub.id, "status": "delivered", "attempts": attempt + 1 }),
                );
                self.bus.publish("webhook.fired", serde_json::json!({ "webhook_id": sub.id, "event": kind }));
                return;
            }
            last_error = if error.is_empty() {
                format!("non-2xx status: {status_code:?}")
            } else {
                error
            };

            if attempt + 1 < max_attempts {
                tokio::time::sleep(backoff_delay(attempt, self.config.base_delay, self.config.max_delay)).await;
            }
        }

        self.increment_failure_count(&sub.id);
        let dlq_id = uuid::Uuid::new_v4().to_string();
        self.inner.lock().unwrap().dlq.push(DeadLetter {
            id: dlq_id,
            webhook_id: sub.id.clone(),
            event_type: kind.to_string(),
            payload: payload.clone(),
            final_error: last_error,
            total_attempts: max_attempts,
            created_at: Utc::now(),
            retried_at: None,
        });
        self.bus.publish(
            "webhook.delivery",
            serde_json::json!({ "webhook_id": sub.id, "status": "dlq", "attempts": max_attempts }),
        );
        self.bus.publish("webhook.failed", serde_json::json!({ "webhook_id": sub.id, "event": kind }));
    }

    fn mark_triggered(&self, id: &str) {
        if let Some(sub) = self.inner.lock().unwrap().subscriptions.get_mut(id) {
            sub.last_triggered_at = Some(Utc::now());
        }
    }

    fn increment_failure_count(&self, id: &str) {
        if let Some(sub) = self.inner.lock().unwrap().subscriptions.get_mut(id) {
            sub.failure_count += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_log(
        &self,
        sub: &WebhookSubscription,
        kind: &str,
        attempt: u32,
        status_code: Option<u16>,
        response_body: &str,
        duration_ms: u64,
        success: bool,
    ) {
        let entry = DeliveryLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            webhook_id: sub.id.clone(),
            event_type: kind.to_string(),
            attempt,
            status_code,
            response_body: truncate_at_char_boundary(response_body, self.config.log_body_truncate),
            duration_ms,
            success,
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().log.push(entry);
    }

    pub fn delivery_log(&self, webhook_id: Option<&str>) -> Vec<DeliveryLogEntry> {
        self.inner
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|e| webhook_id.map(|id| e.webhook_id == id).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().unwrap().dlq.clone()
    }

    /// §4.6 DLQ `retry one`: a single attempt, not the full retry budget.
    pub async fn retry_dead_letter(&self, id: &str) -> Result<(), String> {
        let (sub, dl) = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner.dlq.iter().position(|d| d.id == id).ok_or("no such dead letter")?;
            let mut dl = inner.dlq.remove(idx);
            dl.retried_at = Some(Utc::now());
            let sub = inner.subscriptions.get(&dl.webhook_id).cloned().ok_or("subscription gone")?;
            (sub, dl)
        };
        let mut single_attempt = sub;
        single_attempt.retry_budget = 0;
        self.deliver_to(&single_attempt, &dl.event_type, &dl.payload).await;
        Ok(())
    }

    pub fn purge_dead_letter(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.dlq.len();
        inner.dlq.retain(|d| d.id != id);
        inner.dlq.len() != before
    }

    pub fn purge_all_dead_letters(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.dlq.len();
        inner.dlq.clear();
        count
    }

    /// Spawns a background task that forwards every non-`webhook.*` bus
    /// event into `deliver` for the lifetime of `bus`.
    pub fn spawn_bus_subscriber(engine: std::sync::Arc<Self>, bus: EventBus) {
        tokio::spawn(async move {
            let mut rx = bus.subscribe();
            while let Ok(event) = rx.recv().await {
                engine.deliver(&event.kind, &event.payload).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sub(url: String) -> WebhookSubscription {
        WebhookSubscription {
            id: String::new(),
            name: "test".into(),
            url,
            event_patterns: vec!["process.*".into()],
            filter: None,
            secret: Some("sekret".into()),
            extra_headers: HashMap::new(),
            enabled: true,
            retry_budget: 2,
            timeout_ms: None,
            failure_count: 0,
            last_triggered_at: None,
        }
    }

    fn engine(base_delay_ms: u64, max_delay_ms: u64) -> WebhookEngine {
        WebhookEngine::new(
            WebhookConfig {
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                default_timeout: Duration::from_secs(5),
                log_body_truncate: 4096,
            },
            EventBus::new(),
        )
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let body = b"{\"hello\":\"world\"}";
        let signature = sign("secret", body);
        assert!(verify("secret", body, &signature));
        assert!(!verify("wrong-secret", body, &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let signature = sign("secret", b"original");
        assert!(!verify("secret", b"tampered", &signature));
    }

    #[tokio::test]
    async fn successful_delivery_is_logged_once_and_marks_triggered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let engine = engine(1, 5);
        let subscription = engine.subscribe(sub(format!("{}/hook", server.uri())));
        engine.deliver("process.spawned", &serde_json::json!({ "pid": 1 })).await;

        let log = engine.delivery_log(None);
        assert_eq!(log.len(), 1);
        assert!(log[0].success);
        assert_eq!(log[0].webhook_id, subscription.id);
        assert!(engine.dead_letters().is_empty());
        assert!(engine.list_subscriptions()[0].last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_land_in_dlq_and_bump_failure_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let engine = engine(1, 2);
        let mut s = sub(format!("{}/hook", server.uri()));
        s.retry_budget = 1;
        engine.subscribe(s);
        engine.deliver("process.spawned", &serde_json::json!({})).await;

        assert_eq!(engine.delivery_log(None).len(), 2);
        assert_eq!(engine.dead_letters().len(), 1);
        assert_eq!(engine.dead_letters()[0].total_attempts, 2);
        assert_eq!(engine.list_subscriptions()[0].failure_count, 1);
    }

    #[tokio::test]
    async fn dlq_retry_removes_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let engine = engine(1, 2);
        let mut s = sub(format!("{}/hook", server.uri()));
        s.retry_budget = 0;
        engine.subscribe(s);
        engine.deliver("process.spawned", &serde_json::json!({})).await;
        assert_eq!(engine.dead_letters().len(), 1);

        let id = engine.dead_letters()[0].id.clone();
        engine.retry_dead_letter(&id).await.unwrap();
        assert!(engine.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn webhook_events_never_trigger_delivery() {
        let engine = engine(1, 2);
        engine.subscribe(WebhookSubscription { event_patterns: vec!["*".into()], ..sub("http://localhost:1".into()) });
        engine.deliver("webhook.delivery", &serde_json::json!({})).await;
        assert!(engine.delivery_log(None).is_empty());
    }

    #[test]
    fn filter_requires_matching_payload_fields() {
        assert!(filter_matches(
            &serde_json::json!({ "code": 1 }),
            &serde_json::json!({ "code": 1, "extra": true })
        ));
        assert!(!filter_matches(&serde_json::json!({ "code": 1 }), &serde_json::json!({ "code": 2 })));
    }

    #[test]
    fn inbound_token_is_32_bytes_hex() {
        let token = generate_inbound_token();
        assert_eq!(token.len(), 64);
    }

    #[test]
    fn trigger_inbound_rejects_disabled() {
        let engine = engine(1, 2);
        engine.register_inbound(InboundWebhook {
            id: "1".into(),
            name: "hook".into(),
            token: "tok".into(),
            spawn_config: Value::Null,
            payload_transform: None,
            enabled: false,
            owner: "agent_1".into(),
            trigger_count: 0,
        });
        assert!(engine.trigger_inbound("tok").is_none());
        assert!(engine.trigger_inbound("missing").is_none());
    }
}
