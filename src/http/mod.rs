//! HTTP surface: moderation endpoint and router stats.
//!
//! Thin axum layer over [`ModerationService`] and [`StatsProjector`].
//! All policy lives in the service; this module only translates
//! transport details (headers, status codes, streaming bodies).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ModerationError;
use crate::limiter::client_identifier;
use crate::moderation::{MetricsSnapshot, ModerationRequest, ModerationResult, ModerationService};
use crate::stats::StatsProjector;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The moderation pipeline.
    pub service: Arc<ModerationService>,
    /// Read-only telemetry projection.
    pub stats: Arc<StatsProjector>,
}

/// Builds the application router.
#[must_use]
pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/moderation",
            get(get_moderation).post(post_moderation),
        )
        .route("/model-router/stats", get(get_router_stats))
        .with_state(state)
}

/// Binds `addr` and serves until ctrl-c.
///
/// # Errors
///
/// Returns the bind or serve error.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "moderation service listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

#[derive(Debug, Deserialize)]
struct ModerationBody {
    message: Option<String>,
    locale: Option<String>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ModerationResponseBody {
    #[serde(flatten)]
    result: ModerationResult,
    cached: bool,
    metrics: MetricsSnapshot,
}

/// Derives the client identifier from proxy headers, falling back to
/// the transport peer address.
fn client_id(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    let peer_ip = peer.ip().to_string();
    client_identifier(forwarded, real_ip, Some(&peer_ip))
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid_request", "message": message })),
    )
        .into_response()
}

fn error_response(error: &ModerationError) -> Response {
    match error {
        ModerationError::RateLimited {
            limit,
            reset_at_ms,
            retry_after_secs,
        } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate_limited",
                    "message": "too many requests, slow down",
                    "retryAfter": retry_after_secs,
                })),
            )
                .into_response();
            let headers = response.headers_mut();
            insert_header(headers, header::RETRY_AFTER.as_str(), retry_after_secs);
            insert_header(headers, "x-ratelimit-limit", limit);
            insert_header(headers, "x-ratelimit-remaining", &0u32);
            insert_header(headers, "x-ratelimit-reset", &(reset_at_ms / 1000));
            response
        }
        ModerationError::InvalidRequest { message } => bad_request(message),
        ModerationError::Router(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "routing_failed", "message": e.to_string() })),
        )
            .into_response(),
        ModerationError::Stream { message } => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "stream_failed", "message": message })),
        )
            .into_response(),
    }
}

fn insert_header<T: std::fmt::Display>(headers: &mut HeaderMap, name: &str, value: T) {
    if let (Ok(name), Ok(value)) = (
        header::HeaderName::try_from(name),
        header::HeaderValue::try_from(value.to_string()),
    ) {
        headers.insert(name, value);
    }
}

async fn post_moderation(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(body) = serde_json::from_slice::<ModerationBody>(&body) else {
        return bad_request("body must be JSON with a string `message`");
    };
    let Some(message) = body.message.filter(|m| !m.trim().is_empty()) else {
        return bad_request("`message` is required and must be a non-empty string");
    };

    let client = client_id(&headers, peer);
    let request = ModerationRequest {
        message,
        locale: body.locale,
        stream: body.stream,
    };

    if request.stream {
        return match state.service.handle_stream(&client, &request).await {
            Ok((stream, _backend)) => {
                let body = Body::from_stream(stream.map(|part| part.map(Bytes::from)));
                (
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    body,
                )
                    .into_response()
            }
            Err(e) => error_response(&e),
        };
    }

    match state.service.handle(&client, &request).await {
        Ok(outcome) => Json(ModerationResponseBody {
            result: outcome.result,
            cached: outcome.cached,
            metrics: state.service.status().await.metrics,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_moderation(State(state): State<AppState>) -> Response {
    Json(state.service.status().await).into_response()
}

async fn get_router_stats(State(state): State<AppState>) -> Response {
    Json(state.stats.report()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            header::HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", header::HeaderValue::from_static("10.0.0.2"));
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap_or_else(|_| unreachable!());
        assert_eq!(client_id(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn test_client_id_falls_back_to_peer() {
        let peer: SocketAddr = "192.0.2.7:4000".parse().unwrap_or_else(|_| unreachable!());
        assert_eq!(client_id(&HeaderMap::new(), peer), "192.0.2.7");
    }

    #[test]
    fn test_body_rejects_ill_typed_message() {
        let parsed = serde_json::from_slice::<ModerationBody>(br#"{"message": 42}"#);
        assert!(parsed.is_err());
        let parsed = serde_json::from_slice::<ModerationBody>(br#"{"locale": "en"}"#);
        assert!(parsed.map(|b| b.message.is_none()).unwrap_or(false));
    }
}
