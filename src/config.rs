use std::collections::HashMap;

use anyhow::Result;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::crypto;

/// Default rotation window for obfuscated endpoint UUIDs: 7 days.
const DEFAULT_ROTATION_INTERVAL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind address (e.g. "0.0.0.0:8080")
    pub listen_addr: String,

    /// Base URL of the server-side GTM container. When absent, /events returns 503.
    pub gtm_server_url: Option<String>,

    /// CORS allow list. Empty means auto-detect from the request's own host.
    pub allowed_origins: Vec<String>,

    /// Max requests per rate-limit window, per client IP
    pub rate_limit_requests: u32,

    /// Rate-limit window in milliseconds
    pub rate_limit_window_ms: u64,

    /// Upstream fetch deadline in milliseconds
    pub fetch_timeout_ms: u64,

    /// Rotate endpoint UUIDs on an epoch-bucket schedule
    pub uuid_rotation_enabled: bool,

    /// Epoch bucket size for UUID rotation (env: UUID_ROTATION_INTERVAL_MS)
    pub uuid_rotation_interval_ms: i64,

    /// Secret feeding endpoint-UUID derivation. Auto-generated when absent,
    /// which is fine for a single instance; multi-instance deployments must
    /// pin it or every instance derives different public URLs.
    pub obfuscation_secret: String,

    /// Fixed Facebook endpoint UUID (overrides derivation)
    pub fb_uuid: Option<String>,

    /// Fixed Google endpoint UUID (overrides derivation)
    pub ga_uuid: Option<String>,

    /// Token gating GET /endpoints. Unset means the route answers 503.
    pub endpoints_api_token: Option<String>,

    /// TTL for generic proxied GET responses, in seconds
    pub cache_ttl_secs: u64,

    /// Max inbound request body size in bytes (413 above this)
    pub max_request_size: usize,

    /// Scripts larger than this skip URL extraction and proxy unmodified
    pub script_size_limit: usize,

    /// Alias → real container ID map for query obfuscation (?c=alias → ?id=real)
    pub container_aliases: HashMap<String, String>,

    /// When false, scripts proxy byte-identical (no URL extraction or rewriting)
    pub full_script_proxy_enabled: bool,

    /// Absolute base for minting /x/{uuid} URLs inside rewritten scripts.
    /// Required by the scheduled refresher, which has no inbound request to
    /// infer a host from.
    pub worker_base_url: Option<String>,

    /// Emit X-Proxy-Target / X-Cache-Key debug headers on non-tracking responses
    pub debug_headers_enabled: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let obfuscation_secret = match std::env::var("OBFUSCATION_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                let secret = crypto::default_secret();
                warn!(
                    "OBFUSCATION_SECRET not set — generated an ephemeral secret. \
                     Endpoint UUIDs will differ across instances and restarts."
                );
                secret
            }
        };

        let container_aliases = match std::env::var("GTM_CONTAINER_ALIASES") {
            Ok(raw) if !raw.is_empty() => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "GTM_CONTAINER_ALIASES is not valid JSON — ignoring");
                    HashMap::new()
                }
            },
            _ => HashMap::new(),
        };

        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            gtm_server_url: std::env::var("GTM_SERVER_URL")
                .ok()
                .map(|s| s.trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            rate_limit_requests: env_parse("RATE_LIMIT_REQUESTS", 100),
            rate_limit_window_ms: env_parse("RATE_LIMIT_WINDOW", 60_000),
            fetch_timeout_ms: env_parse("FETCH_TIMEOUT", 10_000),
            uuid_rotation_enabled: env_bool("UUID_ROTATION_ENABLED", false),
            uuid_rotation_interval_ms: env_parse(
                "UUID_ROTATION_INTERVAL_MS",
                DEFAULT_ROTATION_INTERVAL_MS,
            ),
            obfuscation_secret,
            fb_uuid: std::env::var("OBFUSCATION_FB_UUID")
                .ok()
                .filter(|s| !s.is_empty()),
            ga_uuid: std::env::var("OBFUSCATION_GA_UUID")
                .ok()
                .filter(|s| !s.is_empty()),
            endpoints_api_token: std::env::var("ENDPOINTS_API_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
            cache_ttl_secs: env_parse("CACHE_TTL", 3600),
            max_request_size: env_parse("MAX_REQUEST_SIZE", 1024 * 1024),
            script_size_limit: env_parse("SCRIPT_SIZE_LIMIT", 10 * 1024 * 1024),
            container_aliases,
            full_script_proxy_enabled: env_bool("FULL_SCRIPT_PROXY_ENABLED", true),
            worker_base_url: std::env::var("WORKER_BASE_URL")
                .ok()
                .map(|s| s.trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            debug_headers_enabled: env_bool("DEBUG_HEADERS_ENABLED", false),
        })
    }

    /// Currently active obfuscated UUID for a provider ("facebook" / "google").
    ///
    /// A fixed UUID from config wins; otherwise the UUID is derived from the
    /// secret, rotating per epoch bucket when rotation is enabled and pinned
    /// to bucket zero when it is not.
    pub fn provider_uuid(&self, provider: &str, now_ms: i64) -> String {
        let fixed = match provider {
            "facebook" => self.fb_uuid.as_ref(),
            "google" => self.ga_uuid.as_ref(),
            _ => None,
        };
        if let Some(uuid) = fixed {
            return uuid.clone();
        }
        let now = if self.uuid_rotation_enabled { now_ms } else { 0 };
        crypto::endpoint_uuid(
            provider,
            now,
            self.uuid_rotation_interval_ms,
            &self.obfuscation_secret,
        )
    }

    /// Resolve an obfuscated container alias (?c=alias) to the real container ID.
    pub fn resolve_container_alias(&self, alias: &str) -> Option<&str> {
        self.container_aliases.get(alias).map(|s| s.as_str())
    }

    /// Validate the /endpoints access token. Constant-time to avoid leaking
    /// prefix-match timing.
    pub fn validate_endpoints_token(&self, presented: &str) -> bool {
        match &self.endpoints_api_token {
            Some(expected) => expected.as_bytes().ct_eq(presented.as_bytes()).into(),
            None => false,
        }
    }
}
