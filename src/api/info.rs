use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::ProxyError;
use crate::crypto;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    token: Option<String>,
}

/// GET /endpoints?token=…: expose the currently active obfuscated UUIDs so
/// theme snippets and server-side tooling can discover their URLs.
///
/// 503 when no token is configured (the route is opt-in), 401 on a missing
/// or wrong token.
pub async fn endpoints_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InfoQuery>,
) -> Response {
    if state.config.endpoints_api_token.is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Endpoints API is not configured" })),
        )
            .into_response();
    }

    let presented = query.token.as_deref().unwrap_or("");
    if !state.config.validate_endpoints_token(presented) {
        return ProxyError::Unauthorized.into_response();
    }

    let config = &state.config;
    let now_ms = chrono::Utc::now().timestamp_millis();
    let fb_uuid = config.provider_uuid("facebook", now_ms);
    let ga_uuid = config.provider_uuid("google", now_ms);

    let expires_at: Value = if config.uuid_rotation_enabled {
        let next = crypto::next_rotation_ms(now_ms, config.uuid_rotation_interval_ms);
        chrono::DateTime::from_timestamp_millis(next)
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null)
    } else {
        Value::Null
    };

    Json(json!({
        "facebook": {
            "uuid": fb_uuid,
            "script": format!("/cdn/f/{fb_uuid}"),
            "endpoint": format!("/cdn/f/{fb_uuid}"),
        },
        "google": {
            "uuid": ga_uuid,
            "script": format!("/cdn/g/{ga_uuid}"),
            "endpoint": format!("/cdn/g/{ga_uuid}"),
        },
        "rotation": {
            "enabled": config.uuid_rotation_enabled,
            "interval": config.uuid_rotation_interval_ms,
        },
        "expiresAt": expires_at,
        "generatedAt": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}
