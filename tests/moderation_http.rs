//! HTTP-level moderation behavior: rate limiting, caching, streaming,
//! and the introspection endpoints, against a live listener.

#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use switchboard_rs::cache::MemoryCache;
use switchboard_rs::client::message::{ChatRequest, ChatResponse, TokenUsage};
use switchboard_rs::client::provider::TextStream;
use switchboard_rs::client::{LenientValidator, LlmClient};
use switchboard_rs::error::ClientError;
use switchboard_rs::http::{AppState, app};
use switchboard_rs::limiter::RateLimitPolicy;
use switchboard_rs::moderation::{LogAlertSink, ModerationService};
use switchboard_rs::router::{BackendDescriptor, CapabilityTier, ModelRouter};
use switchboard_rs::stats::{StatsConfig, StatsProjector};
use switchboard_rs::telemetry::TelemetryStore;

/// Always returns a safe verdict; counts unary calls.
struct StubClient {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for StubClient {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse {
            content: r#"{
                "language": "English", "language_code": "en", "severity": "safe",
                "categories": [], "confidence": 0.95, "risk_score": 3,
                "flagged": false, "reasoning": "benign"
            }"#
            .to_string(),
            usage: TokenUsage::default(),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn chat_stream(&self, _request: &ChatRequest) -> Result<TextStream, ClientError> {
        let parts = vec![
            Ok("{\"severity\": ".to_string()),
            Ok("\"safe\", \"flagged\": false}".to_string()),
        ];
        Ok(Box::pin(futures_util::stream::iter(parts)))
    }
}

struct Harness {
    base_url: String,
    client: Arc<StubClient>,
    telemetry: Arc<TelemetryStore>,
}

async fn start_server(max_requests: u32) -> Harness {
    let descriptors = vec![BackendDescriptor {
        name: "stub-model".to_string(),
        capability_tier: CapabilityTier::Basic,
        base_cost_per_1k_tokens: 0.01,
        nominal_max_latency_ms: 800,
        supports_structured_output: true,
        supports_streaming: true,
    }];
    let telemetry = Arc::new(TelemetryStore::in_memory(&descriptors));
    let router = Arc::new(ModelRouter::new(
        descriptors,
        Arc::clone(&telemetry),
        "stub-model",
    ));
    let client = Arc::new(StubClient {
        calls: AtomicUsize::new(0),
    });

    let service = Arc::new(ModerationService::new(
        Arc::new(MemoryCache::new()),
        Arc::clone(&router),
        Arc::clone(&client) as Arc<dyn LlmClient>,
        Arc::new(LenientValidator),
        Arc::new(LogAlertSink),
        RateLimitPolicy {
            max_requests,
            window: Duration::from_secs(60),
        },
        Duration::from_secs(600),
        Duration::from_secs(5),
    ));
    let stats = Arc::new(StatsProjector::new(
        Arc::clone(&telemetry),
        StatsConfig::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|e| panic!("bind failed: {e}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|e| panic!("no local addr: {e}"));

    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app(AppState { service, stats })
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });

    Harness {
        base_url: format!("http://{addr}"),
        client,
        telemetry,
    }
}

fn post_body(message: &str) -> serde_json::Value {
    serde_json::json!({ "message": message, "locale": "en" })
}

#[tokio::test]
async fn moderation_round_trip_caches_second_call() {
    let harness = start_server(100).await;
    let http = reqwest::Client::new();
    let url = format!("{}/moderation", harness.base_url);

    let first: serde_json::Value = http
        .post(&url)
        .json(&post_body("hello"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"))
        .json()
        .await
        .unwrap_or_else(|e| panic!("bad json: {e}"));
    assert_eq!(first["severity"], "safe");
    assert_eq!(first["cached"], false);

    let second: serde_json::Value = http
        .post(&url)
        .json(&post_body("hello"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"))
        .json()
        .await
        .unwrap_or_else(|e| panic!("bad json: {e}"));
    assert_eq!(second["cached"], true);
    assert_eq!(second["metrics"]["cache_hits"], 1);

    // One backend invocation total, and telemetry advanced exactly once.
    assert_eq!(harness.client.calls.load(Ordering::SeqCst), 1);
    let call_count = harness
        .telemetry
        .backend("stub-model")
        .map(|t| t.call_count)
        .unwrap_or_default();
    assert_eq!(call_count, 1);
}

#[tokio::test]
async fn rate_limit_blocks_fourth_request_with_headers() {
    let harness = start_server(3).await;
    let http = reqwest::Client::new();
    let url = format!("{}/moderation", harness.base_url);

    for i in 0..3 {
        let response = http
            .post(&url)
            .json(&post_body(&format!("message {i}")))
            .send()
            .await
            .unwrap_or_else(|e| panic!("request failed: {e}"));
        assert_eq!(response.status(), 200, "request {i} should pass");
    }

    let blocked = http
        .post(&url)
        .json(&post_body("message 3"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"));
    assert_eq!(blocked.status(), 429);

    let retry_after: u64 = blocked
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("missing retry-after header"));
    assert!(retry_after >= 1 && retry_after <= 60);
    assert_eq!(
        blocked
            .headers()
            .get("x-ratelimit-limit")
            .and_then(|v| v.to_str().ok()),
        Some("3")
    );
    assert_eq!(
        blocked
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
    assert!(blocked.headers().contains_key("x-ratelimit-reset"));

    let body: serde_json::Value = blocked
        .json()
        .await
        .unwrap_or_else(|e| panic!("bad json: {e}"));
    assert_eq!(body["error"], "rate_limited");
    assert!(body["retryAfter"].is_u64());
}

#[tokio::test]
async fn missing_message_is_bad_request() {
    let harness = start_server(100).await;
    let http = reqwest::Client::new();
    let url = format!("{}/moderation", harness.base_url);

    let response = http
        .post(&url)
        .json(&serde_json::json!({ "locale": "en" }))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"));
    assert_eq!(response.status(), 400);

    let response = http
        .post(&url)
        .json(&serde_json::json!({ "message": 42 }))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"));
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn streaming_returns_plain_text_deltas() {
    let harness = start_server(100).await;
    let http = reqwest::Client::new();
    let url = format!("{}/moderation", harness.base_url);

    let response = http
        .post(&url)
        .json(&serde_json::json!({ "message": "hello", "stream": true }))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"));
    assert_eq!(response.status(), 200);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/plain"))
    );
    let body = response
        .text()
        .await
        .unwrap_or_else(|e| panic!("body read failed: {e}"));
    assert_eq!(body, "{\"severity\": \"safe\", \"flagged\": false}");
}

#[tokio::test]
async fn introspection_endpoints_report_state() {
    let harness = start_server(100).await;
    let http = reqwest::Client::new();

    http.post(format!("{}/moderation", harness.base_url))
        .json(&post_body("hello"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"));

    let status: serde_json::Value = http
        .get(format!("{}/moderation", harness.base_url))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"))
        .json()
        .await
        .unwrap_or_else(|e| panic!("bad json: {e}"));
    assert_eq!(status["cache"]["type"], "memory");
    assert_eq!(status["metrics"]["evaluations"], 1);

    let stats: serde_json::Value = http
        .get(format!("{}/model-router/stats", harness.base_url))
        .send()
        .await
        .unwrap_or_else(|e| panic!("request failed: {e}"))
        .json()
        .await
        .unwrap_or_else(|e| panic!("bad json: {e}"));
    assert_eq!(stats["summary"]["total_decisions"], 1);
    assert_eq!(stats["model_usage"]["stub-model"], 1);
    assert!(stats["comparison"].is_array());
}
