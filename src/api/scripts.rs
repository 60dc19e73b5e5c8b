use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Extension;

use crate::api::common::{
    append_query, has_refresh_bypass, proxied_response, request_base, script_response,
};
use crate::api::error::ProxyError;
use crate::cache::script::ScriptKey;
use crate::endpoints::is_valid_uuid_segment;
use crate::pipeline::ClientIp;
use crate::proxy::{ProxyOptions, CACHE_STATUS_HIT_SCRIPT};
use crate::AppState;

/// Provider tracking endpoints fronted by the obfuscated POST routes.
pub const FACEBOOK_TRACK_URL: &str = "https://www.facebook.com/tr";
pub const GOOGLE_COLLECT_URL: &str = "https://www.google-analytics.com/g/collect";
pub const GOOGLE_J_COLLECT_URL: &str = "https://www.google-analytics.com/j/collect";

// ---------------------------------------------------------------------------
// Obfuscated provider routes: /cdn/f/{uuid}, /cdn/g/{uuid}
// ---------------------------------------------------------------------------

pub async fn facebook_script(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if !is_valid_uuid_segment(&uuid) {
        return ProxyError::NotFound.into_response();
    }
    let key = ScriptKey::named("fbevents");
    serve_script(state, key, uri, headers).await
}

pub async fn facebook_script_rest(
    state: State<Arc<AppState>>,
    Path((uuid, _rest)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    facebook_script(state, Path(uuid), uri, headers).await
}

pub async fn facebook_track(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_valid_uuid_segment(&uuid) {
        return ProxyError::NotFound.into_response();
    }
    forward_tracking(state, FACEBOOK_TRACK_URL, Method::POST, uri, headers, client_ip, body).await
}

pub async fn facebook_track_rest(
    state: State<Arc<AppState>>,
    Path((uuid, _rest)): Path<(String, String)>,
    client_ip: Extension<ClientIp>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    facebook_track(state, Path(uuid), client_ip, uri, headers, body).await
}

pub async fn google_script(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if !is_valid_uuid_segment(&uuid) {
        return ProxyError::NotFound.into_response();
    }
    let key = match google_script_key(&state.config, uri.query()) {
        Ok(key) => key,
        Err(e) => return e.into_response(),
    };
    serve_script(state, key, uri, headers).await
}

pub async fn google_script_rest(
    state: State<Arc<AppState>>,
    Path((uuid, _rest)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    google_script(state, Path(uuid), uri, headers).await
}

pub async fn google_track(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_valid_uuid_segment(&uuid) {
        return ProxyError::NotFound.into_response();
    }
    forward_tracking(state, GOOGLE_COLLECT_URL, Method::POST, uri, headers, client_ip, body).await
}

pub async fn google_track_rest(
    state: State<Arc<AppState>>,
    Path((uuid, _rest)): Path<(String, String)>,
    client_ip: Extension<ClientIp>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    google_track(state, Path(uuid), client_ip, uri, headers, body).await
}

// ---------------------------------------------------------------------------
// Legacy paths: /cdn|assets|static/{name}.js, /tr, /g/collect, /j/collect
// ---------------------------------------------------------------------------

/// Name-based script lookup for themes that still reference unobfuscated
/// paths. The last path segment's stem picks the script.
pub async fn legacy_script(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let name = rest
        .rsplit('/')
        .next()
        .unwrap_or("")
        .trim_end_matches(".js");

    let key = match name {
        "fbevents" => ScriptKey::named("fbevents"),
        "gtag" | "gtm" => match google_script_key(&state.config, uri.query()) {
            Ok(key) => key,
            Err(e) => return e.into_response(),
        },
        _ => return ProxyError::NotFound.into_response(),
    };
    serve_script(state, key, uri, headers).await
}

pub async fn legacy_facebook_track(
    State(state): State<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward_tracking(state, FACEBOOK_TRACK_URL, method, uri, headers, client_ip, body).await
}

pub async fn legacy_google_collect(
    State(state): State<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward_tracking(state, GOOGLE_COLLECT_URL, method, uri, headers, client_ip, body).await
}

pub async fn legacy_google_j_collect(
    State(state): State<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward_tracking(state, GOOGLE_J_COLLECT_URL, method, uri, headers, client_ip, body).await
}

// ---------------------------------------------------------------------------
// Shared resolution and forwarding
// ---------------------------------------------------------------------------

/// Resolve the Google script key from the request query: `?id=` carries the
/// real container ID, `?c=` an obfuscated alias (unknown aliases pass
/// through as IDs). Without either, the bare gtag loader is served.
pub fn google_script_key(
    config: &crate::config::AppConfig,
    query: Option<&str>,
) -> Result<ScriptKey, ProxyError> {
    let mut container_id: Option<String> = None;
    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "id" => container_id = Some(value.into_owned()),
                "c" => {
                    container_id = Some(
                        config
                            .resolve_container_alias(&value)
                            .map(str::to_string)
                            .unwrap_or_else(|| value.into_owned()),
                    )
                }
                _ => {}
            }
        }
    }

    match container_id {
        Some(id) => {
            let kind = if id.starts_with("GTM-") { "gtm" } else { "gtag" };
            ScriptKey::container(kind, &id)
        }
        None => Ok(ScriptKey::named("gtag")),
    }
}

async fn serve_script(
    state: Arc<AppState>,
    key: ScriptKey,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(upstream_url) = key.upstream_url() else {
        return ProxyError::NotFound.into_response();
    };

    let query = uri.query();
    let force_refresh = has_refresh_bypass(query);
    let base = request_base(&headers);

    match state
        .scripts
        .serve(&key, &upstream_url, &headers, base.as_deref(), force_refresh)
        .await
    {
        Ok(served) => {
            if served.cache_status == CACHE_STATUS_HIT_SCRIPT {
                state.metrics.record_script_cache_hit();
            }
            let mut response =
                script_response(&served.script, served.cache_status, state.config.cache_ttl_secs);
            if state.config.debug_headers_enabled {
                let headers = response.headers_mut();
                if let Some(host) = crate::rewrite::host_of(&upstream_url) {
                    if let Ok(v) = axum::http::HeaderValue::from_str(&host) {
                        headers.insert("x-proxy-target", v);
                    }
                }
                if let Ok(v) = axum::http::HeaderValue::from_str(key.as_str()) {
                    headers.insert("x-cache-key", v);
                }
            }
            response
        }
        Err(e) => {
            state.metrics.record_upstream_error();
            e.into_response()
        }
    }
}

async fn forward_tracking(
    state: Arc<AppState>,
    target_base: &str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    client_ip: ClientIp,
    body: Bytes,
) -> Response {
    let target = append_query(target_base, uri.query());
    let body = (!body.is_empty()).then_some(body);

    let result = state
        .engine
        .proxy(
            &target,
            method,
            &headers,
            body,
            client_ip.0.as_deref(),
            uri.path(),
            uri.query(),
            ProxyOptions {
                preserve_headers: true,
                allow_cache: false,
            },
        )
        .await;

    match result {
        // Tracking responses never expose cache-state headers
        Ok(proxied) => proxied_response(&proxied, false),
        Err(e) => {
            state.metrics.record_upstream_error();
            e.into_response()
        }
    }
}
