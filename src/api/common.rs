//! Helpers shared across handlers. Only genuinely repeated patterns live
//! here; we do NOT over-abstract.

use axum::body::Body;
use axum::http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, Response, StatusCode};

use crate::cache::script::ProcessedScript;
use crate::proxy::ProxiedResponse;

/// Base URL of this proxy as the client reached it, for minting absolute
/// rewritten URLs. Scheme comes from the edge's forwarded-proto header,
/// defaulting to https (the only scheme merchants serve pixels over).
pub fn request_base(headers: &HeaderMap) -> Option<String> {
    let host = headers.get("host").and_then(|v| v.to_str().ok())?;
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    Some(format!("{proto}://{host}"))
}

/// Append a request's query string to a resolved target URL with the right
/// joiner.
pub fn append_query(target: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => {
            let joiner = if target.contains('?') { '&' } else { '?' };
            format!("{target}{joiner}{q}")
        }
        _ => target.to_string(),
    }
}

/// True when the query string carries the `_refresh=1` cache bypass.
pub fn has_refresh_bypass(query: Option<&str>) -> bool {
    query
        .map(|q| q.split('&').any(|param| param == "_refresh=1"))
        .unwrap_or(false)
}

/// Build the response for a served script body.
pub fn script_response(
    script: &ProcessedScript,
    cache_status: &str,
    client_ttl_secs: u64,
) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("x-cache-status", cache_status)
        .header(
            CACHE_CONTROL,
            format!("public, max-age={client_ttl_secs}"),
        );
    if let Some(ct) = &script.content_type {
        if let Ok(v) = HeaderValue::from_str(ct) {
            builder = builder.header(CONTENT_TYPE, v);
        }
    }
    // Builder errors only on invalid header values, all validated above
    builder.body(Body::from(script.body.clone())).unwrap()
}

/// Build the response for a generic proxied upstream result.
///
/// Tracking endpoints never expose cache-state headers, so `X-Cache-Status`
/// is only attached when asked for.
pub fn proxied_response(proxied: &ProxiedResponse, expose_cache_status: bool) -> Response<Body> {
    let mut builder = Response::builder()
        .status(proxied.status)
        .header(CACHE_CONTROL, proxied.cache_control.clone());
    if expose_cache_status {
        builder = builder.header("x-cache-status", proxied.cache_status);
    }
    if let Some(ct) = &proxied.content_type {
        if let Ok(v) = HeaderValue::from_str(ct) {
            builder = builder.header(CONTENT_TYPE, v);
        }
    }
    builder.body(Body::from(proxied.body.clone())).unwrap()
}
