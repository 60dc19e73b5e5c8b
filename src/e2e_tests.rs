//! Whole-router tests: request in, response out, upstreams mocked.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiremock::matchers::{body_json_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::cache::script::{ProcessedScript, ScriptKey};
use crate::config::tests::base_config;
use crate::config::AppConfig;
use crate::{build_router, AppState};

fn router_with(config: AppConfig) -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::from_config(config));
    (build_router(state.clone()), state)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ---------------------------------------------------------------------------
// Dynamic endpoints: /x/{uuid}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dynamic_endpoint_round_trip_reattaches_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tr"))
        .and(query_param("ev", "PageView"))
        .and(query_param("foo", "1"))
        .and(header("x-forwarded-for", "1.2.3.4"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tracked"))
        .expect(1)
        .mount(&server)
        .await;

    let (app, state) = router_with(base_config());
    // Mint an endpoint for a URL that carries a query: normalization drops it
    let endpoint = state
        .registry
        .create(&format!("{}/tr?ev=PageView&foo=1", server.uri()))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/x/{}?ev=PageView&foo=1", endpoint.uuid))
                .header("x-real-ip", "1.2.3.4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // Tracking responses never expose cache-state headers
    assert!(response.headers().get("x-cache-status").is_none());
    assert_eq!(body_string(response).await, "tracked");
}

#[tokio::test]
async fn unknown_dynamic_uuid_is_404_with_full_header_set() {
    let (app, _state) = router_with(base_config());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/x/deadbeefdeadbeefdeadbeefdeadbeef")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    // Even errors carry the security and rate-limit headers
    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert!(headers.get("x-ratelimit-limit").is_some());
    assert!(headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn malformed_path_uuids_are_404() {
    let (app, _state) = router_with(base_config());
    for bad in [
        "/x/short",                    // under 12 chars
        "/x/ABCDEF012345",             // uppercase
        "/x/zzzzzzzzzzzz",             // non-hex
        "/cdn/f/not-a-uuid",
        "/cdn/g/UPPERCASE0123",
    ] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(bad).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "path {bad}");
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn third_request_in_window_is_rejected() {
    let config = AppConfig {
        rate_limit_requests: 2,
        rate_limit_window_ms: 60_000,
        ..base_config()
    };
    let (app, _state) = router_with(config);

    let mut statuses = Vec::new();
    let mut last = None;
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-real-ip", "1.2.3.4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        statuses.push(response.status());
        last = Some(response);
    }

    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
    let rejected = last.unwrap();
    assert_eq!(rejected.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let retry_after: i64 = rejected
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn different_ips_do_not_share_windows() {
    let config = AppConfig {
        rate_limit_requests: 1,
        ..base_config()
    };
    let (app, _state) = router_with(config);

    for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-real-ip", ip)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "ip {ip}");
    }
}

// ---------------------------------------------------------------------------
// Endpoints info auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn endpoints_info_requires_exact_token() {
    let config = AppConfig {
        endpoints_api_token: Some("tok".into()),
        ..base_config()
    };
    let (app, state) = router_with(config);

    let no_token = app
        .clone()
        .oneshot(Request::builder().uri("/endpoints").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(no_token.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/endpoints?token=wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let ok = app
        .oneshot(
            Request::builder()
                .uri("/endpoints?token=tok")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let now_ms = chrono::Utc::now().timestamp_millis();
    let body: serde_json::Value = serde_json::from_str(&body_string(ok).await).unwrap();
    assert_eq!(
        body["facebook"]["uuid"],
        state.config.provider_uuid("facebook", now_ms)
    );
    assert_eq!(
        body["google"]["uuid"],
        state.config.provider_uuid("google", now_ms)
    );
    assert_eq!(body["rotation"]["enabled"], false);
}

#[tokio::test]
async fn endpoints_info_unconfigured_is_503() {
    let (app, _state) = router_with(base_config());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/endpoints?token=anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ---------------------------------------------------------------------------
// Script serving: stale fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_script_serves_with_stale_marker() {
    let (app, state) = router_with(base_config());
    let key = ScriptKey::named("fbevents");

    state
        .scripts
        .cache()
        .store(
            &key,
            &ProcessedScript {
                body: bytes::Bytes::from_static(b"stale fbevents body"),
                content_type: Some("application/javascript".into()),
            },
            false,
        )
        .await;
    // Expire the fresh entry, leaving only stale + hash
    state
        .cache
        .delete(&crate::cache::cache_key(
            crate::cache::BUCKET_SCRIPT,
            key.as_str(),
        ))
        .await;

    let fb_uuid = state
        .config
        .provider_uuid("facebook", chrono::Utc::now().timestamp_millis());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/cdn/f/{fb_uuid}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-cache-status").unwrap(), "stale");
    assert_eq!(body_string(response).await, "stale fbevents body");
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_unconfigured_returns_503() {
    let (app, _state) = router_with(base_config());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"event_name":"x","client_id":"c"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn events_translates_and_forwards_to_gtm_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/g/collect"))
        .and(query_param("measurement_id", "G-ABC123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let config = AppConfig {
        gtm_server_url: Some(server.uri()),
        ..base_config()
    };
    let (app, _state) = router_with(config);

    let event = serde_json::json!({
        "event_name": "purchase",
        "client_id": "c.99",
        "measurement_id": "G-ABC123",
        "timestamp_micros": "1700000000000000",
        "page_location": "https://shop.example.com/checkout",
        "value": 42
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(event.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn events_rejects_invalid_names_before_forwarding() {
    let server = MockServer::start().await;
    // No mocks mounted: any forward would 404 the mock server; but the
    // request must be rejected before any upstream call.
    let config = AppConfig {
        gtm_server_url: Some(server.uri()),
        ..base_config()
    };
    let (app, _state) = router_with(config);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"event_name":"bad name!","client_id":"c"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn events_non_2xx_upstream_is_502() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/g/collect"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = AppConfig {
        gtm_server_url: Some(server.uri()),
        ..base_config()
    };
    let (app, _state) = router_with(config);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"event_name":"x","client_id":"c"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    // Sanitized message, no upstream details
    assert_eq!(body_string(response).await, r#"{"error":"Bad gateway"}"#);
}

// ---------------------------------------------------------------------------
// Pipeline: preflight, size cap, health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn options_preflight_is_answered_with_cors() {
    let config = AppConfig {
        allowed_origins: vec!["https://shop.example.com".into()],
        ..base_config()
    };
    let (app, _state) = router_with(config);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/cdn/f/aabbccddeeff0011")
                .header("origin", "https://shop.example.com")
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "https://shop.example.com"
    );
    assert_eq!(headers.get("access-control-allow-credentials").unwrap(), "true");
    assert!(headers.get("access-control-allow-methods").is_some());
    // A disallowed origin is not echoed back
    let denied = app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/cdn/f/aabbccddeeff0011")
                .header("origin", "https://evil.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(denied.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn cross_origin_responses_carry_cors_and_pipeline_headers() {
    let config = AppConfig {
        allowed_origins: vec!["https://shop.example.com".into()],
        ..base_config()
    };
    let (app, _state) = router_with(config);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("origin", "https://shop.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "https://shop.example.com"
    );
    assert_eq!(headers.get("access-control-allow-credentials").unwrap(), "true");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert!(headers.get("x-ratelimit-limit").is_some());
}

#[tokio::test]
async fn oversize_content_length_is_413() {
    let (app, state) = router_with(base_config());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-length", (state.config.max_request_size + 1).to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn health_reports_status_and_is_uncacheable() {
    let (app, _state) = router_with(base_config());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["rateLimit"]["limit"], 100);
    assert!(body["metrics"]["requests_total"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let (app, _state) = router_with(base_config());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/definitely/not/a/route")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Tracking POST through an obfuscated provider path (body passthrough)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dynamic_post_forwards_body_and_preserved_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collect"))
        .and(header("cookie", "_ga=GA1.1.1"))
        .and(body_json_string(r#"{"en":"page_view"}"#))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (app, state) = router_with(base_config());
    let endpoint = state
        .registry
        .create(&format!("{}/collect", server.uri()))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/x/{}", endpoint.uuid))
                .header("cookie", "_ga=GA1.1.1")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"en":"page_view"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
