use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use tracing::debug;

use crate::api::common::{append_query, proxied_response};
use crate::api::error::ProxyError;
use crate::api::scripts::google_script_key;
use crate::cache::script::ScriptKey;
use crate::config::AppConfig;
use crate::endpoints::is_valid_uuid_segment;
use crate::pipeline::ClientIp;
use crate::proxy::ProxyOptions;
use crate::AppState;

/// GET/POST /x/{uuid}: forward to the URL this UUID was minted for.
///
/// The stored target is query-free (UUIDs derive from normalized URLs), so
/// the live request's query string is reattached before forwarding. Headers
/// are preserved and nothing is cached: dynamic endpoints carry per-user
/// tracking hits.
pub async fn dynamic_proxy(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_valid_uuid_segment(&uuid) {
        return ProxyError::NotFound.into_response();
    }

    let target = match state.registry.get_target_url(&uuid).await {
        Some(target) => Some(target),
        None => try_recover(&state, &uuid, &headers).await,
    };
    let Some(target) = target else {
        debug!(uuid = %uuid, "Unknown dynamic endpoint");
        return ProxyError::NotFound.into_response();
    };

    let target = append_query(&target, uri.query());
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
        Ok(proxied) => proxied_response(&proxied, false),
        Err(e) => {
            state.metrics.record_upstream_error();
            e.into_response()
        }
    }
}

/// A UUID can go unknown when its registry entry expired after a rotation
/// flip while a client still runs the cached script embedding it. If the
/// Referer names one of our script paths, re-deriving that script's
/// endpoints usually heals the mapping.
async fn try_recover(state: &AppState, uuid: &str, headers: &HeaderMap) -> Option<String> {
    let referer = headers.get("referer")?.to_str().ok()?;
    let key = script_key_from_referer(referer, &state.config)?;
    state.scripts.recover_unknown_uuid(uuid, &key).await
}

/// Map a Referer URL onto the ScriptKey it was served under, if any.
fn script_key_from_referer(referer: &str, config: &AppConfig) -> Option<ScriptKey> {
    let parsed = url::Url::parse(referer).ok()?;
    let path = parsed.path();
    let query = parsed.query();

    if path.starts_with("/cdn/f/") {
        return Some(ScriptKey::named("fbevents"));
    }
    if path.starts_with("/cdn/g/") {
        return google_script_key(config, query).ok();
    }

    // Legacy name-based paths
    let stem = path.rsplit('/').next()?.trim_end_matches(".js");
    match stem {
        "fbevents" => Some(ScriptKey::named("fbevents")),
        "gtag" | "gtm" => google_script_key(config, query).ok(),
        _ => None,
    }
}
