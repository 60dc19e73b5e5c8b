use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use crate::api::error::ProxyError;
use crate::headers::{apply_rate_limit, apply_request_id, apply_security};
use crate::limiter::RateDecision;
use crate::AppState;

/// Client IP as seen by the edge, resolved once per request and made
/// available to handlers through request extensions.
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

/// First-hop client address from the edge's headers.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    for name in ["cf-connecting-ip", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Rate-limit bucket group for a request. Tracking hits and script fetches
/// have very different volumes, so they never share a window. Any POST is a
/// tracking hit, including ones on the provider script paths.
pub fn endpoint_group(method: &Method, path: &str) -> &'static str {
    if *method == Method::POST
        || path.starts_with("/x/")
        || path == "/tr"
        || path.ends_with("/collect")
    {
        "tracking"
    } else if path.starts_with("/cdn") || path.starts_with("/assets") || path.starts_with("/static")
    {
        "scripts"
    } else {
        "meta"
    }
}

/// Per-request pipeline: validate → rate-limit → dispatch → finish headers.
///
/// Every response leaving this middleware (handler output, 413, 429)
/// carries security and rate-limit headers and a fresh request id. CORS
/// headers and preflights are owned by the router's `CorsLayer`, which
/// wraps outside this middleware.
pub async fn request_pipeline(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    state.metrics.record_request();

    let path = req.uri().path().to_string();

    // Oversize bodies are refused before any routing work
    let content_length = req
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(length) = content_length {
        if length > state.config.max_request_size {
            let response = (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({ "error": "Request body too large" })),
            )
                .into_response();
            return finish(response, None);
        }
    }

    let client_ip = extract_client_ip(req.headers());
    let limiter_key = client_ip.as_deref().unwrap_or("unknown");
    let group = endpoint_group(req.method(), &path);
    let decision = state.limiter.check(limiter_key, group).await;

    if !decision.allowed {
        state.metrics.record_rate_limited();
        debug!(ip = %limiter_key, path = %path, "Rate limited");
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut response = ProxyError::TooManyRequests.into_response();
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after_secs(now_ms).to_string()) {
            response.headers_mut().insert("retry-after", v);
        }
        return finish(response, Some(&decision));
    }

    req.extensions_mut().insert(ClientIp(client_ip));

    let response = next.run(req).await;
    finish(response, Some(&decision))
}

fn finish(mut response: Response, decision: Option<&RateDecision>) -> Response {
    let headers = response.headers_mut();
    apply_security(headers);
    if let Some(decision) = decision {
        apply_rate_limit(headers, decision);
    }
    apply_request_id(headers);
    response
}
