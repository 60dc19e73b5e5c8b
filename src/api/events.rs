use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::api::error::ProxyError;
use crate::AppState;

static EVENT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("event name regex"));
static MEASUREMENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^G-[A-Z0-9]+$").expect("measurement id regex"));

/// Browser-side event as posted to /events. Unknown fields become custom
/// event parameters.
#[derive(Debug, Deserialize)]
struct EventPayload {
    event_name: String,
    client_id: String,
    measurement_id: Option<String>,
    timestamp_micros: Option<String>,
    user_properties: Option<Value>,
    page_location: Option<Value>,
    page_title: Option<Value>,
    page_referrer: Option<Value>,
    session_id: Option<Value>,
    engagement_time_msec: Option<Value>,
    #[serde(flatten)]
    custom: Map<String, Value>,
}

/// POST /events: validate a browser event and forward it to the server-side
/// GTM container as a GA4 Measurement Protocol hit.
pub async fn collect_event(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let Some(gtm_base) = state.config.gtm_server_url.as_deref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Server-side eventing is not configured" })),
        )
            .into_response();
    };

    let payload: EventPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return ProxyError::BadRequest(format!("invalid event body: {e}")).into_response()
        }
    };

    if let Err(e) = validate(&payload) {
        return e.into_response();
    }

    let hit = translate(&payload, chrono::Utc::now().timestamp_micros());
    let mut target = format!("{gtm_base}/g/collect");
    if let Some(id) = &payload.measurement_id {
        target = format!("{target}?measurement_id={id}");
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let hit_body = match serde_json::to_vec(&hit) {
        Ok(b) => Bytes::from(b),
        Err(e) => return ProxyError::Internal(e.to_string()).into_response(),
    };

    let upstream = match state
        .engine
        .client()
        .fetch(Method::POST, &target, headers, Some(hit_body))
        .await
    {
        Ok(u) => u,
        Err(e) => {
            state.metrics.record_upstream_error();
            return e.into_response();
        }
    };

    if !upstream.status.is_success() {
        state.metrics.record_upstream_error();
        return ProxyError::UpstreamHttp(format!("{} from GTM server", upstream.status))
            .into_response();
    }

    info!(event = %payload.event_name, "Server-side event forwarded");
    Json(json!({ "success": true })).into_response()
}

fn validate(payload: &EventPayload) -> Result<(), ProxyError> {
    if payload.event_name.is_empty() || payload.client_id.is_empty() {
        return Err(ProxyError::BadRequest(
            "event_name and client_id are required".into(),
        ));
    }
    if !EVENT_NAME_RE.is_match(&payload.event_name) {
        return Err(ProxyError::BadRequest(
            "event_name must match ^[A-Za-z0-9_]+$".into(),
        ));
    }
    if let Some(id) = &payload.measurement_id {
        if !MEASUREMENT_ID_RE.is_match(id) {
            return Err(ProxyError::BadRequest(
                "measurement_id must match ^G-[A-Z0-9]+$".into(),
            ));
        }
    }
    Ok(())
}

/// Shape the validated payload as a GA4 Measurement Protocol hit.
fn translate(payload: &EventPayload, now_micros: i64) -> Value {
    let mut params = Map::new();
    let mut put = |name: &str, value: &Option<Value>| {
        if let Some(v) = value {
            if !v.is_null() {
                params.insert(name.to_string(), v.clone());
            }
        }
    };
    put("page_location", &payload.page_location);
    put("page_title", &payload.page_title);
    put("page_referrer", &payload.page_referrer);
    put("session_id", &payload.session_id);
    put("engagement_time_msec", &payload.engagement_time_msec);
    for (name, value) in &payload.custom {
        if !value.is_null() {
            params.insert(name.clone(), value.clone());
        }
    }

    let timestamp = payload
        .timestamp_micros
        .clone()
        .unwrap_or_else(|| now_micros.to_string());

    let mut hit = Map::new();
    hit.insert("client_id".into(), Value::String(payload.client_id.clone()));
    hit.insert("timestamp_micros".into(), Value::String(timestamp));
    if let Some(up) = &payload.user_properties {
        if !up.is_null() {
            hit.insert("user_properties".into(), up.clone());
        }
    }
    hit.insert(
        "events".into(),
        json!([{ "name": payload.event_name, "params": params }]),
    );
    Value::Object(hit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(raw: Value) -> EventPayload {
        serde_json::from_value(raw).unwrap()
    }

    // -----------------------------------------------------------------------
    // validation
    // -----------------------------------------------------------------------

    #[test]
    fn valid_minimal_event_passes() {
        let p = payload(json!({ "event_name": "page_view", "client_id": "c.1" }));
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn event_name_charset_is_enforced() {
        for bad in ["page view", "page-view", "page.view", "événement", ""] {
            let p = payload(json!({ "event_name": bad, "client_id": "c.1" }));
            assert!(validate(&p).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn missing_required_fields_fail() {
        let p = payload(json!({ "event_name": "x", "client_id": "" }));
        assert!(validate(&p).is_err());
        assert!(serde_json::from_value::<EventPayload>(json!({ "event_name": "x" })).is_err());
    }

    #[test]
    fn measurement_id_pattern_is_enforced() {
        let ok = payload(json!({
            "event_name": "x", "client_id": "c", "measurement_id": "G-AB12CD34"
        }));
        assert!(validate(&ok).is_ok());

        for bad in ["GTM-ABC123", "g-abc123", "G-", "UA-12345-1"] {
            let p = payload(json!({
                "event_name": "x", "client_id": "c", "measurement_id": bad
            }));
            assert!(validate(&p).is_err(), "accepted {bad}");
        }
    }

    // -----------------------------------------------------------------------
    // translation
    // -----------------------------------------------------------------------

    #[test]
    fn translate_builds_measurement_protocol_shape() {
        let p = payload(json!({
            "event_name": "add_to_cart",
            "client_id": "c.42",
            "page_location": "https://shop.example.com/p/1",
            "session_id": "s-1",
            "value": 19.99,
            "currency": "EUR"
        }));
        let hit = translate(&p, 1_700_000_000_000_000);

        assert_eq!(hit["client_id"], "c.42");
        assert_eq!(hit["timestamp_micros"], "1700000000000000");
        assert_eq!(hit["events"][0]["name"], "add_to_cart");
        let params = &hit["events"][0]["params"];
        assert_eq!(params["page_location"], "https://shop.example.com/p/1");
        assert_eq!(params["session_id"], "s-1");
        // Custom fields ride along as event params
        assert_eq!(params["value"], 19.99);
        assert_eq!(params["currency"], "EUR");
    }

    #[test]
    fn explicit_timestamp_wins_over_now() {
        let p = payload(json!({
            "event_name": "x", "client_id": "c", "timestamp_micros": "123456"
        }));
        let hit = translate(&p, 999);
        assert_eq!(hit["timestamp_micros"], "123456");
    }

    #[test]
    fn user_properties_are_top_level_not_params() {
        let p = payload(json!({
            "event_name": "x", "client_id": "c",
            "user_properties": { "tier": { "value": "gold" } }
        }));
        let hit = translate(&p, 0);
        assert_eq!(hit["user_properties"]["tier"]["value"], "gold");
        assert!(hit["events"][0]["params"].get("user_properties").is_none());
    }

    #[test]
    fn null_fields_are_dropped() {
        let p = payload(json!({
            "event_name": "x", "client_id": "c",
            "page_title": null, "extra": null
        }));
        let hit = translate(&p, 0);
        let params = hit["events"][0]["params"].as_object().unwrap();
        assert!(params.is_empty());
    }
}
