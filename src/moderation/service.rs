//! The moderation request handler.
//!
//! Pipeline per request: rate limit → cache → route → invoke → record →
//! alert. Schema failures get one in-band retry, then a hand-parsed
//! degraded verdict; anything worse degrades to the fail-safe verdict.
//! Streaming requests bypass the cache and tap telemetry on completion.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tracing::{debug, info, warn};

use super::alert::{AlertRecord, AlertSink};
use super::metrics::{MetricsSnapshot, RollingMetrics};
use super::prompt::{MODERATION_SYSTEM_PROMPT, build_moderation_prompt};
use super::result::{ModerationResult, Severity, moderation_schema};
use crate::cache::{CacheAdapter, hashed_key};
use crate::client::message::{ChatRequest, system_message, user_message};
use crate::client::provider::TextStream;
use crate::client::{LlmClient, Schema, SchemaValidator};
use crate::error::{ClientError, ModerationError};
use crate::limiter::{RateLimitPolicy, RateLimiter, epoch_ms};
use crate::router::{Capability, Complexity, ModelRouter, Priority, RouterConfig, TaskKind};
use crate::telemetry::TelemetryStore;

/// Latency budget requested from the router for moderation calls.
const MODERATION_MAX_LATENCY_MS: u64 = 2000;

/// Response budget for moderation calls.
const MAX_OUTPUT_TOKENS: u32 = 512;

/// One inbound moderation request.
#[derive(Debug, Clone)]
pub struct ModerationRequest {
    /// Content to review.
    pub message: String,
    /// Optional locale hint for language detection.
    pub locale: Option<String>,
    /// Stream structured-output deltas instead of a unary verdict.
    pub stream: bool,
}

/// A unary moderation answer.
#[derive(Debug, Clone)]
pub struct ModerationOutcome {
    /// The verdict, invariants enforced.
    pub result: ModerationResult,
    /// Whether the verdict came from cache.
    pub cached: bool,
    /// Backend that produced the verdict; `None` on cache hits.
    pub backend: Option<String>,
}

/// Read-only service status for the introspection endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModerationStatus {
    /// Rolling request metrics.
    pub metrics: MetricsSnapshot,
    /// Cache adapter kind and live entry count when countable.
    pub cache: CacheStatus,
}

/// Cache portion of [`ModerationStatus`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatus {
    /// Adapter kind, `"memory"` or `"remote"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Live entries, when the adapter can count them.
    pub size: Option<usize>,
}

/// End-to-end moderation handler.
pub struct ModerationService {
    cache: Arc<dyn CacheAdapter>,
    limiter: RateLimiter,
    limit_policy: RateLimitPolicy,
    router: Arc<ModelRouter>,
    client: Arc<dyn LlmClient>,
    validator: Arc<dyn SchemaValidator>,
    alerts: Arc<dyn AlertSink>,
    metrics: Mutex<RollingMetrics>,
    schema: Schema,
    result_ttl: Duration,
    call_timeout: Duration,
}

impl ModerationService {
    /// Wires the service from its collaborators.
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheAdapter>,
        router: Arc<ModelRouter>,
        client: Arc<dyn LlmClient>,
        validator: Arc<dyn SchemaValidator>,
        alerts: Arc<dyn AlertSink>,
        limit_policy: RateLimitPolicy,
        result_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(Arc::clone(&cache), "moderation"),
            cache,
            limit_policy,
            router,
            client,
            validator,
            alerts,
            metrics: Mutex::new(RollingMetrics::default()),
            schema: moderation_schema(),
            result_ttl,
            call_timeout,
        }
    }

    /// Rate-limit policy this service enforces.
    #[must_use]
    pub const fn limit_policy(&self) -> RateLimitPolicy {
        self.limit_policy
    }

    /// Handles one unary request from `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::RateLimited`] on limit, a
    /// [`ModerationError::InvalidRequest`] for unusable input, and a
    /// router configuration error verbatim. Backend failures do not
    /// error: they degrade to the fail-safe verdict.
    pub async fn handle(
        &self,
        client_id: &str,
        request: &ModerationRequest,
    ) -> Result<ModerationOutcome, ModerationError> {
        self.check_limit(client_id).await?;
        let message = validated_message(&request.message)?;
        let cache_key = self.cache_key(message, request.locale.as_deref());

        if let Some(hit) = self.cached_result(&cache_key).await {
            debug!(client_id, "moderation cache hit");
            self.with_metrics(RollingMetrics::record_cache_hit);
            return Ok(ModerationOutcome {
                result: hit,
                cached: true,
                backend: None,
            });
        }

        let config = RouterConfig::new(
            TaskKind::Classification,
            Priority::Speed,
            Complexity::Low,
        )
        .with_max_latency_ms(MODERATION_MAX_LATENCY_MS)
        .require(Capability::StructuredOutput);
        let selection = self.router.select(&config)?;

        let started = Instant::now();
        let result = self
            .evaluate(&selection.backend, message, request.locale.as_deref())
            .await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(client_id, error = %e, "moderation degraded to fail-safe verdict");
                self.with_metrics(RollingMetrics::record_error);
                return Ok(ModerationOutcome {
                    result: ModerationResult::fail_safe(&e.to_string()),
                    cached: false,
                    backend: Some(selection.backend),
                });
            }
        };

        self.with_metrics(|m| m.record_evaluation(&result, latency_ms));

        if result.flagged || result.severity == Severity::Critical {
            self.alerts.emit(&AlertRecord {
                ts: epoch_ms(),
                client_id: client_id.to_string(),
                severity: result.severity,
                categories: result.categories.clone(),
                risk_score: result.risk_score,
                message_preview: AlertRecord::preview_of(message),
                reasoning: result.reasoning.clone(),
            });
        }

        // Critical verdicts are always re-evaluated, never cached.
        if result.severity != Severity::Critical {
            self.store_result(&cache_key, &result).await;
        }

        info!(
            client_id,
            backend = %selection.backend,
            severity = result.severity.as_str(),
            flagged = result.flagged,
            latency_ms,
            "moderation verdict"
        );

        Ok(ModerationOutcome {
            result,
            cached: false,
            backend: Some(selection.backend),
        })
    }

    /// Handles one streaming request from `client_id`.
    ///
    /// The cache is bypassed (a partial verdict is not cacheable) and
    /// telemetry is updated when the returned stream completes or is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Same as [`handle`](Self::handle), plus
    /// [`ModerationError::Stream`] when stream setup fails.
    pub async fn handle_stream(
        &self,
        client_id: &str,
        request: &ModerationRequest,
    ) -> Result<(TextStream, String), ModerationError> {
        self.check_limit(client_id).await?;
        let message = validated_message(&request.message)?;

        let config = RouterConfig::new(
            TaskKind::Classification,
            Priority::Speed,
            Complexity::Low,
        )
        .with_max_latency_ms(MODERATION_MAX_LATENCY_MS)
        .require(Capability::StructuredOutput)
        .require(Capability::Streaming);
        let selection = self.router.select(&config)?;

        let chat_request = self.build_request(&selection.backend, message, request.locale.as_deref());
        let started = Instant::now();
        let inner = self
            .client
            .chat_stream(&chat_request)
            .await
            .map_err(|e| {
                self.router
                    .telemetry()
                    .update(&selection.backend, elapsed_ms(started), false);
                ModerationError::Stream {
                    message: e.to_string(),
                }
            })?;

        self.with_metrics(RollingMetrics::record_streamed);
        info!(client_id, backend = %selection.backend, "moderation stream started");

        let tapped = TelemetryTap {
            inner,
            telemetry: Arc::clone(self.router.telemetry()),
            backend: selection.backend.clone(),
            started,
            errored: false,
            completed: false,
            reported: false,
        };
        Ok((Box::pin(tapped), selection.backend))
    }

    /// Service status: rolling metrics plus cache shape.
    pub async fn status(&self) -> ModerationStatus {
        let metrics = self
            .metrics
            .lock()
            .map(|m| m.snapshot())
            .unwrap_or_else(|_| RollingMetrics::default().snapshot());
        ModerationStatus {
            metrics,
            cache: CacheStatus {
                kind: self.cache.kind(),
                size: self.cache.entry_count().await,
            },
        }
    }

    async fn check_limit(&self, client_id: &str) -> Result<(), ModerationError> {
        let decision = self.limiter.check(client_id, self.limit_policy).await;
        if decision.allowed {
            Ok(())
        } else {
            Err(ModerationError::RateLimited {
                limit: decision.limit,
                reset_at_ms: decision.reset_at_ms,
                retry_after_secs: decision.retry_after_secs(epoch_ms()),
            })
        }
    }

    fn cache_key(&self, message: &str, locale: Option<&str>) -> String {
        let normalized = message.trim().to_lowercase();
        hashed_key("moderation", &[&normalized, locale.unwrap_or("")])
    }

    async fn cached_result(&self, key: &str) -> Option<ModerationResult> {
        let bytes = self.cache.get(key).await.ok().flatten()?;
        match serde_json::from_slice::<ModerationResult>(&bytes) {
            Ok(result) => Some(result.normalized()),
            Err(e) => {
                warn!(error = %e, "cached verdict unparseable, treating as miss");
                None
            }
        }
    }

    async fn store_result(&self, key: &str, result: &ModerationResult) {
        let Ok(bytes) = serde_json::to_vec(result) else {
            return;
        };
        if let Err(e) = self.cache.set(key, bytes, self.result_ttl).await {
            warn!(error = %e, "verdict cache write failed");
        }
    }

    fn build_request(&self, backend: &str, message: &str, locale: Option<&str>) -> ChatRequest {
        ChatRequest {
            model: backend.to_string(),
            messages: vec![
                system_message(MODERATION_SYSTEM_PROMPT),
                user_message(&build_moderation_prompt(message, locale)),
            ],
            temperature: Some(0.0),
            max_tokens: Some(MAX_OUTPUT_TOKENS),
            json_mode: true,
            stream: false,
        }
    }

    /// One evaluation: invoke, validate, retry once on schema failure,
    /// then hand-parse before giving up.
    async fn evaluate(
        &self,
        backend: &str,
        message: &str,
        locale: Option<&str>,
    ) -> Result<ModerationResult, ClientError> {
        let request = self.build_request(backend, message, locale);

        let first = self.invoke(backend, &request).await?;
        let first_err = match self.parse(&first) {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        // Malformed structured output is transient for exactly one retry.
        debug!(backend, error = %first_err, "moderation output malformed, retrying once");
        let second = self.invoke(backend, &request).await?;
        match self.parse(&second) {
            Ok(result) => Ok(result),
            Err(e) => ModerationResult::hand_parse(&second).map_or(Err(e), Ok),
        }
    }

    async fn invoke(&self, backend: &str, request: &ChatRequest) -> Result<String, ClientError> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.call_timeout, self.client.chat(request)).await;
        let latency_ms = elapsed_ms(started);

        let result = match outcome {
            Ok(Ok(response)) => Ok(response.content),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::DeadlineExceeded {
                timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        self.router
            .telemetry()
            .update(backend, latency_ms, result.is_ok());
        result
    }

    fn parse(&self, raw: &str) -> Result<ModerationResult, ClientError> {
        let value = self.validator.validate(&self.schema, raw)?;
        let result: ModerationResult =
            serde_json::from_value(value).map_err(|e| ClientError::SchemaValidation {
                message: format!("coerced moderation output untypeable: {e}"),
                content: raw.to_string(),
            })?;
        Ok(result.normalized())
    }

    fn with_metrics(&self, f: impl FnOnce(&mut RollingMetrics)) {
        if let Ok(mut metrics) = self.metrics.lock() {
            f(&mut metrics);
        }
    }
}

fn validated_message(message: &str) -> Result<&str, ModerationError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(ModerationError::InvalidRequest {
            message: "message must be a non-empty string".to_string(),
        });
    }
    Ok(trimmed)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Stream adapter that reports one telemetry outcome when the stream
/// finishes or is dropped. A dropped or failed stream counts as a
/// failed call; a cleanly finished one counts as a success.
struct TelemetryTap {
    inner: TextStream,
    telemetry: Arc<TelemetryStore>,
    backend: String,
    started: Instant,
    errored: bool,
    completed: bool,
    reported: bool,
}

impl TelemetryTap {
    fn report(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;
        self.telemetry.update(
            &self.backend,
            elapsed_ms(self.started),
            self.completed && !self.errored,
        );
    }
}

impl Stream for TelemetryTap {
    type Item = Result<String, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.completed = true;
                this.report();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.errored = true;
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for TelemetryTap {
    fn drop(&mut self) {
        self.report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::client::message::{ChatResponse, TokenUsage};
    use crate::client::{LenientValidator, LlmClient};
    use crate::router::{BackendDescriptor, CapabilityTier};
    use crate::telemetry::TelemetryStore;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns scripted responses in order, then repeats the last.
    struct ScriptedClient {
        responses: Vec<Result<String, ()>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<String, ()>>) -> Arc<Self> {
            Arc::new(Self {
                responses,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self
                .responses
                .get(call)
                .or_else(|| self.responses.last())
                .cloned()
                .unwrap_or(Err(()));
            match scripted {
                Ok(content) => Ok(ChatResponse {
                    content,
                    usage: TokenUsage::default(),
                    finish_reason: Some("stop".to_string()),
                }),
                Err(()) => Err(ClientError::ApiRequest {
                    message: "scripted backend failure".to_string(),
                    status: Some(503),
                }),
            }
        }

        async fn chat_stream(&self, _request: &ChatRequest) -> Result<TextStream, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let parts = vec![Ok("{\"severity\":".to_string()), Ok("\"safe\"}".to_string())];
            Ok(Box::pin(futures_util::stream::iter(parts)))
        }
    }

    fn safe_verdict_json() -> String {
        r#"{
            "language": "English", "language_code": "en", "severity": "safe",
            "categories": [], "confidence": 0.97, "risk_score": 2,
            "flagged": false, "reasoning": "benign greeting"
        }"#
        .to_string()
    }

    fn critical_verdict_json() -> String {
        r#"{
            "language": "English", "language_code": "en", "severity": "critical",
            "categories": ["violence"], "confidence": 0.99, "risk_score": 96,
            "flagged": false, "reasoning": "explicit threat"
        }"#
        .to_string()
    }

    struct CountingSink(AtomicUsize);

    impl AlertSink for CountingSink {
        fn emit(&self, _record: &AlertRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service(client: Arc<ScriptedClient>, max_requests: u32) -> (ModerationService, Arc<CountingSink>) {
        let descriptors = vec![BackendDescriptor {
            name: "mod-model".to_string(),
            capability_tier: CapabilityTier::Basic,
            base_cost_per_1k_tokens: 0.01,
            nominal_max_latency_ms: 900,
            supports_structured_output: true,
            supports_streaming: true,
        }];
        let telemetry = Arc::new(TelemetryStore::in_memory(&descriptors));
        let router = Arc::new(ModelRouter::new(descriptors, telemetry, "mod-model"));
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let service = ModerationService::new(
            Arc::new(MemoryCache::new()),
            router,
            client,
            Arc::new(LenientValidator),
            Arc::clone(&sink) as Arc<dyn AlertSink>,
            RateLimitPolicy {
                max_requests,
                window: Duration::from_secs(60),
            },
            Duration::from_secs(600),
            Duration::from_secs(5),
        );
        (service, sink)
    }

    fn request(message: &str) -> ModerationRequest {
        ModerationRequest {
            message: message.to_string(),
            locale: Some("en".to_string()),
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_second_identical_request_hits_cache() {
        let client = ScriptedClient::new(vec![Ok(safe_verdict_json())]);
        let (service, _) = service(Arc::clone(&client), 100);

        let first = service
            .handle("10.0.0.1", &request("hello"))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(!first.cached);
        assert_eq!(first.backend.as_deref(), Some("mod-model"));

        let second = service
            .handle("10.0.0.1", &request("hello"))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(second.cached);
        assert!(second.backend.is_none());

        // One model call total; telemetry advanced exactly once.
        assert_eq!(client.calls(), 1);
        let calls = service
            .router
            .telemetry()
            .backend("mod-model")
            .map(|t| t.call_count)
            .unwrap_or_default();
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_normalization_makes_cache_key_insensitive() {
        let client = ScriptedClient::new(vec![Ok(safe_verdict_json())]);
        let (service, _) = service(Arc::clone(&client), 100);

        service
            .handle("ip", &request("Hello There"))
            .await
            .unwrap_or_else(|_| unreachable!());
        let second = service
            .handle("ip", &request("  hello there  "))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(second.cached);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_critical_verdict_never_cached_and_alerts() {
        let client = ScriptedClient::new(vec![
            Ok(critical_verdict_json()),
            Ok(critical_verdict_json()),
        ]);
        let (service, sink) = service(Arc::clone(&client), 100);

        let first = service
            .handle("ip", &request("threatening message"))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(first.result.severity, Severity::Critical);
        // The invariant repair kicked in: critical implies flagged.
        assert!(first.result.flagged);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        let second = service
            .handle("ip", &request("threatening message"))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(!second.cached);
        assert_eq!(client.calls(), 2);
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_fail_safe() {
        let client = ScriptedClient::new(vec![Err(())]);
        let (service, sink) = service(Arc::clone(&client), 100);

        let outcome = service
            .handle("ip", &request("anything"))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(outcome.result.severity, Severity::Safe);
        assert!(!outcome.result.flagged);
        assert!(outcome.result.reasoning.starts_with("error:"));
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);

        let status = service.status().await;
        assert_eq!(status.metrics.errors, 1);
        assert_eq!(status.metrics.evaluations, 0);
    }

    #[tokio::test]
    async fn test_schema_failure_retries_once_then_succeeds() {
        let client = ScriptedClient::new(vec![
            Ok("not json at all".to_string()),
            Ok(safe_verdict_json()),
        ]);
        let (service, _) = service(Arc::clone(&client), 100);

        let outcome = service
            .handle("ip", &request("hello"))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(!outcome.cached);
        assert_eq!(outcome.result.severity, Severity::Safe);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_schema_failure_twice_hand_parses() {
        let client = ScriptedClient::new(vec![
            Ok("garbage".to_string()),
            Ok("verdict: CRITICAL, trust me".to_string()),
        ]);
        let (service, sink) = service(Arc::clone(&client), 100);

        let outcome = service
            .handle("ip", &request("hello"))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(outcome.result.severity, Severity::Critical);
        assert!(outcome.result.flagged);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_after_budget() {
        let client = ScriptedClient::new(vec![Ok(safe_verdict_json())]);
        let (service, _) = service(client, 2);

        for i in 0..2 {
            assert!(
                service
                    .handle("9.9.9.9", &request(&format!("msg {i}")))
                    .await
                    .is_ok()
            );
        }
        let blocked = service.handle("9.9.9.9", &request("msg 3")).await;
        assert!(matches!(
            blocked,
            Err(ModerationError::RateLimited { limit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_message_is_invalid() {
        let client = ScriptedClient::new(vec![Ok(safe_verdict_json())]);
        let (service, _) = service(client, 100);
        let result = service.handle("ip", &request("   ")).await;
        assert!(matches!(
            result,
            Err(ModerationError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_bypasses_cache_and_taps_telemetry() {
        let client = ScriptedClient::new(vec![Ok(safe_verdict_json())]);
        let (service, _) = service(Arc::clone(&client), 100);

        let req = ModerationRequest {
            message: "hello".to_string(),
            locale: None,
            stream: true,
        };
        let (mut stream, backend) = service
            .handle_stream("ip", &req)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(backend, "mod-model");

        let mut collected = String::new();
        while let Some(part) = stream.next().await {
            collected.push_str(&part.unwrap_or_default());
        }
        assert_eq!(collected, "{\"severity\":\"safe\"}");
        drop(stream);

        let calls = service
            .router
            .telemetry()
            .backend("mod-model")
            .map(|t| t.call_count)
            .unwrap_or_default();
        assert_eq!(calls, 1);
        assert_eq!(service.status().await.metrics.streamed, 1);
    }
}
