use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::api::error::ProxyError;
use crate::cache::CacheLayer;
use crate::headers::{build_upstream_headers, UpstreamMode};

/// Hard ceiling on upstream bodies we will buffer. Anything larger is not a
/// script or tracking response this proxy should be relaying.
const MAX_UPSTREAM_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Query parameters that mark a request as a tracking hit. Tracking hits are
/// per-user and must never be served from cache.
const TRACKING_QUERY_SIGNATURES: &[&str] = &["v=2", "tid=", "_p="];

/// An upstream response, fully buffered.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Thin wrapper over reqwest with a wall-clock deadline per call.
///
/// Redirects are followed (reqwest's default, limited to 10 hops). A fired
/// deadline surfaces as `UpstreamTimeout` so metrics can separate it from
/// connection failures.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl UpstreamClient {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout_ms,
        }
    }

    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let deadline = Duration::from_millis(self.timeout_ms);

        // Encoding is negotiated by the client library so bodies arrive
        // identity-encoded: the rewriter needs plain text, and the
        // compression layer re-encodes toward the browser.
        headers.remove("accept-encoding");

        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = match tokio::time::timeout(deadline, request.send()).await {
            Err(_) => return Err(ProxyError::UpstreamTimeout(self.timeout_ms)),
            Ok(Err(e)) => return Err(ProxyError::UpstreamHttp(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = match tokio::time::timeout(deadline, response.bytes()).await {
            Err(_) => return Err(ProxyError::UpstreamTimeout(self.timeout_ms)),
            Ok(Err(e)) => return Err(ProxyError::UpstreamHttp(e.to_string())),
            Ok(Ok(bytes)) => bytes,
        };

        if body.len() > MAX_UPSTREAM_BODY_BYTES {
            return Err(ProxyError::UpstreamBodyTooLarge);
        }

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

/// How a proxied response was produced, exposed as `X-Cache-Status`.
pub const CACHE_STATUS_HIT: &str = "HIT";
pub const CACHE_STATUS_MISS: &str = "MISS";
pub const CACHE_STATUS_HIT_SCRIPT: &str = "HIT-SCRIPT";
pub const CACHE_STATUS_STALE: &str = "stale";

#[derive(Debug, Clone, Copy)]
pub struct ProxyOptions {
    /// Preserve the curated tracking header set (tracking endpoints) instead
    /// of the minimal script-fetch set.
    pub preserve_headers: bool,
    /// Permit the generic response cache for this request.
    pub allow_cache: bool,
}

/// A response ready for the HTTP boundary.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub cache_status: &'static str,
    pub cache_control: String,
}

/// Cache admission policy for the generic proxy path.
pub fn should_cache(method: &Method, request_path: &str, request_query: Option<&str>) -> bool {
    if method != Method::GET {
        return false;
    }
    if request_path == "/health" || request_path == "/options" {
        return false;
    }
    if let Some(query) = request_query {
        let tracking = query.split('&').any(|param| {
            TRACKING_QUERY_SIGNATURES
                .iter()
                .any(|sig| param == *sig || (sig.ends_with('=') && param.starts_with(sig)))
        });
        if tracking {
            return false;
        }
    }
    true
}

/// Generic fetch-through-cache engine for non-script targets.
///
/// Cloning is cheap — clones share the client and cache.
#[derive(Clone)]
pub struct ProxyEngine {
    client: UpstreamClient,
    cache: CacheLayer,
    cache_ttl_secs: u64,
}

impl ProxyEngine {
    pub fn new(client: UpstreamClient, cache: CacheLayer, cache_ttl_secs: u64) -> Self {
        Self {
            client,
            cache,
            cache_ttl_secs,
        }
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    /// Forward a request to `target_url` and assemble the client response.
    ///
    /// Cacheable GETs are answered from the generic response cache when
    /// possible and written back on miss; cache write failures never fail
    /// the request. Upstream statuses pass through untouched; only
    /// transport-level failures map to 502.
    pub async fn proxy(
        &self,
        target_url: &str,
        method: Method,
        incoming_headers: &HeaderMap,
        body: Option<Bytes>,
        client_ip: Option<&str>,
        request_path: &str,
        request_query: Option<&str>,
        opts: ProxyOptions,
    ) -> Result<ProxiedResponse, ProxyError> {
        let cacheable =
            opts.allow_cache && should_cache(&method, request_path, request_query);

        if cacheable {
            if let Some(entry) = self.cache.get(target_url).await {
                debug!(target = %target_url, "Generic cache hit");
                return Ok(ProxiedResponse {
                    status: StatusCode::OK,
                    content_type: entry.content_type.clone(),
                    body: entry.body.clone(),
                    cache_status: CACHE_STATUS_HIT,
                    cache_control: entry.cache_control.clone(),
                });
            }
        }

        let mode = if opts.preserve_headers {
            UpstreamMode::Preserve
        } else {
            UpstreamMode::Minimal
        };
        let upstream_headers = build_upstream_headers(incoming_headers, mode, client_ip);

        let upstream = self
            .client
            .fetch(method, target_url, upstream_headers, body)
            .await?;

        let cache_control = if cacheable {
            format!("public, max-age={}", self.cache_ttl_secs)
        } else {
            "no-store, no-cache, must-revalidate".to_string()
        };

        if cacheable && upstream.status.is_success() {
            self.cache
                .put(
                    target_url.to_string(),
                    upstream.body.clone(),
                    upstream.content_type.clone(),
                    self.cache_ttl_secs,
                )
                .await;
        } else if cacheable {
            warn!(target = %target_url, status = %upstream.status, "Not caching non-success upstream response");
        }

        Ok(ProxiedResponse {
            status: upstream.status,
            content_type: upstream.content_type,
            body: upstream.body,
            cache_status: CACHE_STATUS_MISS,
            cache_control,
        })
    }
}
