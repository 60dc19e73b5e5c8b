use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CACHE_CONTROL;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// GET /health: status snapshot for uptime checks and dashboards.
/// Never cached.
pub async fn health(State(state): State<Arc<crate::AppState>>) -> Response {
    let config = &state.config;
    let body = json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "rateLimit": {
            "limit": config.rate_limit_requests,
            "windowMs": config.rate_limit_window_ms,
        },
        "config": {
            "rotationEnabled": config.uuid_rotation_enabled,
            "fullScriptProxy": config.full_script_proxy_enabled,
            "serverSideEvents": config.gtm_server_url.is_some(),
            "cacheEntries": state.cache.entry_count(),
        },
        "edgeLocation": std::env::var("EDGE_LOCATION").ok(),
        "metrics": state.metrics.snapshot(),
    });

    ([(CACHE_CONTROL, "no-store")], Json(body)).into_response()
}
