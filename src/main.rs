mod api;
mod cache;
mod config;
mod crypto;
mod endpoints;
mod headers;
mod limiter;
mod metrics;
mod pipeline;
mod proxy;
mod refresh;
mod rewrite;
mod scripts;

#[cfg(test)]
mod e2e_tests;

use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::script::ScriptCache;
use crate::cache::CacheLayer;
use crate::config::AppConfig;
use crate::endpoints::DynamicEndpointRegistry;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::proxy::{ProxyEngine, UpstreamClient};
use crate::scripts::ScriptService;

/// Upper bound on shared-cache entries. Script triples and dynamic-endpoint
/// records are small; this is sized for headroom, not pressure.
const CACHE_MAX_ENTRIES: u64 = 100_000;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub cache: CacheLayer,
    pub limiter: RateLimiter,
    pub registry: DynamicEndpointRegistry,
    pub scripts: ScriptService,
    pub engine: ProxyEngine,
    pub metrics: Metrics,
}

impl AppState {
    /// Wire up every component from a config. The cache layer is the only
    /// shared store; everything else is cheap clones around it.
    pub fn from_config(config: AppConfig) -> Self {
        let cache = CacheLayer::new(CACHE_MAX_ENTRIES);
        let limiter = RateLimiter::new(
            cache.clone(),
            config.rate_limit_requests,
            config.rate_limit_window_ms,
        );
        let client = UpstreamClient::new(config.fetch_timeout_ms);
        let script_cache = ScriptCache::new(cache.clone());
        let registry =
            DynamicEndpointRegistry::new(cache.clone()).with_script_cache(script_cache.clone());
        let scripts = ScriptService::new(
            script_cache,
            registry.clone(),
            client.clone(),
            config.full_script_proxy_enabled,
            config.script_size_limit,
            config.worker_base_url.clone(),
        );
        let engine = ProxyEngine::new(client, cache.clone(), config.cache_ttl_secs);

        Self {
            config,
            cache,
            limiter,
            registry,
            scripts,
            engine,
            metrics: Metrics::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing. LOG_LEVEL takes an env-filter string; RUST_LOG
    // still wins when set.
    let default_filter =
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "edgecloak=info,tower_http=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting edgecloak v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration once; it is immutable from here on
    let config = AppConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        rotation = config.uuid_rotation_enabled,
        full_script_proxy = config.full_script_proxy_enabled,
        "Configuration loaded"
    );

    if config.worker_base_url.is_none() {
        tracing::warn!(
            "WORKER_BASE_URL not set — scheduled refreshes will mint relative \
             proxy paths, which only resolve for same-origin script consumers"
        );
    }

    let state = Arc::new(AppState::from_config(config));

    // Background refresh of well-known scripts (12h cadence)
    refresh::spawn_refresher(state.scripts.clone());

    let app = build_router(state.clone());

    let addr = state.config.listen_addr.parse::<std::net::SocketAddr>()?;
    info!("Starting HTTP server on {addr} (TLS terminates at the edge)");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config);
    api::routes(state.clone())
        .layer(DefaultBodyLimit::max(state.config.max_request_size))
        .layer(middleware::from_fn_with_state(
            state,
            pipeline::request_pipeline,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
}

/// CORS layer over the whole router. The predicate implements the policy
/// from `headers::origin_allowed`: configured allow-list, or auto-detect
/// against the request's own host, with the literal "null" origin allowed
/// for sandboxed pixel iframes. tower-http mirrors the allowed origin
/// verbatim, so the wildcard never appears alongside credentials.
fn build_cors_layer(config: &AppConfig) -> CorsLayer {
    let allowed_origins = config.allowed_origins.clone();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, parts: &axum::http::request::Parts| {
                let Ok(origin) = origin.to_str() else {
                    return false;
                };
                let host = parts
                    .headers
                    .get("host")
                    .and_then(|v| v.to_str().ok());
                headers::origin_allowed(origin, host, &allowed_origins)
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(86_400))
}
