use std::time::Duration;

use aether_kernel::config::WebhookConfig;
use aether_kernel::kernel::event_bus::EventBus;
use aether_kernel::kernel::webhook::{InboundWebhook, WebhookEngine, WebhookSubscription};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry_config() -> WebhookConfig {
    WebhookConfig {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        default_timeout: Duration::from_secs(2),
        log_body_truncate: 4096,
    }
}

fn subscription(id: &str, url: String) -> WebhookSubscription {
    WebhookSubscription {
        id: id.to_string(),
        name: "test sub".to_string(),
        url,
        event_patterns: vec!["agent.*".to_string()],
        filter: None,
        secret: Some("shh".to_string()),
        extra_headers: Default::default(),
        enabled: true,
        retry_budget: 2,
        timeout_ms: None,
        failure_count: 0,
        last_triggered_at: None,
    }
}

#[tokio::test]
async fn successful_delivery_is_logged_and_marks_the_subscription_triggered() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&mock_server)
        .await;

    let engine = WebhookEngine::new(fast_retry_config(), EventBus::new());
    let sub = engine.subscribe(subscription("sub-1", format!("{}/hook", mock_server.uri())));

    engine.deliver("agent.log", &json!({"message": "hi"})).await;

    let log = engine.delivery_log(Some(&sub.id));
    assert_eq!(log.len(), 1);
    assert!(log[0].success);
    assert_eq!(log[0].attempt, 1);
    assert!(engine.dead_letters().is_empty());
}

#[tokio::test]
async fn always_failing_endpoint_exhausts_retries_and_lands_in_the_dead_letter_queue() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let engine = WebhookEngine::new(fast_retry_config(), EventBus::new());
    let sub = engine.subscribe(subscription("sub-2", format!("{}/hook", mock_server.uri())));

    engine.deliver("agent.log", &json!({})).await;

    // retry_budget = 2 means 3 total attempts before giving up.
    let log = engine.delivery_log(Some(&sub.id));
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|e| !e.success));

    let dlq = engine.dead_letters();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].webhook_id, sub.id);
    assert_eq!(dlq[0].total_attempts, 3);
}

#[tokio::test]
async fn disabled_subscription_never_receives_a_delivery_attempt() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let engine = WebhookEngine::new(fast_retry_config(), EventBus::new());
    let mut sub = subscription("sub-3", format!("{}/hook", mock_server.uri()));
    sub.enabled = false;
    engine.subscribe(sub);

    engine.deliver("agent.log", &json!({})).await;
    assert!(engine.delivery_log(None).is_empty());
}

#[tokio::test]
async fn webhook_events_are_never_redelivered_to_avoid_delivery_loops() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let engine = WebhookEngine::new(fast_retry_config(), EventBus::new());
    let mut sub = subscription("sub-4", format!("{}/hook", mock_server.uri()));
    sub.event_patterns = vec!["*".to_string()];
    engine.subscribe(sub);

    engine.deliver("webhook.delivery", &json!({})).await;
    assert!(engine.delivery_log(None).is_empty());
}

#[tokio::test]
async fn retry_dead_letter_spends_a_single_attempt_not_the_full_retry_budget() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let engine = WebhookEngine::new(fast_retry_config(), EventBus::new());
    let sub = engine.subscribe(subscription("sub-5", format!("{}/hook", mock_server.uri())));
    engine.deliver("agent.log", &json!({})).await;
    assert_eq!(engine.dead_letters().len(), 1);

    let dlq_id = engine.dead_letters()[0].id.clone();
    let before = engine.delivery_log(Some(&sub.id)).len();
    engine.retry_dead_letter(&dlq_id).await.unwrap();

    // one more attempt recorded, not a fresh 3-attempt retry budget; the
    // still-failing endpoint lands the retry back in the dead-letter queue.
    let after = engine.delivery_log(Some(&sub.id)).len();
    assert_eq!(after, before + 1);
    assert_eq!(engine.dead_letters().len(), 1);
}

#[test]
fn hmac_signature_round_trips_and_rejects_tampered_bodies() {
    use aether_kernel::kernel::webhook::{sign, verify};

    let secret = "topsecret";
    let body = b"{\"event\":\"agent.log\"}";
    let signature = sign(secret, body);

    assert!(verify(secret, body, &signature));
    assert!(!verify(secret, b"{\"event\":\"tampered\"}", &signature));
    assert!(!verify("wrong-secret", body, &signature));
}

#[test]
fn inbound_token_generation_produces_distinct_hex_tokens() {
    use aether_kernel::kernel::webhook::generate_inbound_token;

    let a = generate_inbound_token();
    let b = generate_inbound_token();
    assert_ne!(a, b);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn trigger_inbound_is_indistinguishable_for_unknown_and_disabled_tokens() {
    let engine = WebhookEngine::new(fast_retry_config(), EventBus::new());
    engine.register_inbound(InboundWebhook {
        id: "hook-1".to_string(),
        name: "disabled hook".to_string(),
        token: "tok-disabled".to_string(),
        spawn_config: json!({}),
        payload_transform: None,
        enabled: false,
        owner: "agent_0".to_string(),
        trigger_count: 0,
    });

    assert!(engine.trigger_inbound("does-not-exist").is_none());
    assert!(engine.trigger_inbound("tok-disabled").is_none());
}
