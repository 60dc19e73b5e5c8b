pub mod common;
pub mod dynamic;
pub mod error;
pub mod events;
pub mod health;
pub mod info;
pub mod scripts;

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;

use crate::AppState;
use error::ProxyError;

/// All routes, most specific first. Obfuscated provider paths dispatch on
/// method: GET serves the script, POST forwards the tracking hit.
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/endpoints", get(info::endpoints_info))
        .route("/events", post(events::collect_event))
        .route(
            "/cdn/f/{uuid}",
            get(scripts::facebook_script).post(scripts::facebook_track),
        )
        .route(
            "/cdn/f/{uuid}/{*rest}",
            get(scripts::facebook_script_rest).post(scripts::facebook_track_rest),
        )
        .route(
            "/cdn/g/{uuid}",
            get(scripts::google_script).post(scripts::google_track),
        )
        .route(
            "/cdn/g/{uuid}/{*rest}",
            get(scripts::google_script_rest).post(scripts::google_track_rest),
        )
        .route("/x/{uuid}", any(dynamic::dynamic_proxy))
        .route("/cdn/{*path}", get(scripts::legacy_script))
        .route("/assets/{*path}", get(scripts::legacy_script))
        .route("/static/{*path}", get(scripts::legacy_script))
        .route("/tr", any(scripts::legacy_facebook_track))
        .route("/g/collect", any(scripts::legacy_google_collect))
        .route("/j/collect", any(scripts::legacy_google_j_collect))
        .fallback(|| async { ProxyError::NotFound.into_response() })
        .with_state(state)
}
