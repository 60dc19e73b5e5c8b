use std::collections::HashMap;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::api::error::ProxyError;
use crate::cache::script::{
    CacheStatus, ProcessedScript, RefreshOutcome, ScriptCache, ScriptKey,
};
use crate::endpoints::DynamicEndpointRegistry;
use crate::headers::{build_upstream_headers, UpstreamMode};
use crate::proxy::{UpstreamClient, CACHE_STATUS_HIT_SCRIPT, CACHE_STATUS_MISS, CACHE_STATUS_STALE};
use crate::rewrite::{extract_urls, rewrite_script, ExtractOptions, FilterMode};

/// Serves analytics scripts through the rewrite pipeline: fetch upstream,
/// extract embedded tracker URLs, mint dynamic endpoints for them, substitute
/// proxy paths into the body, and cache the processed result.
///
/// Cloning is cheap — clones share every underlying store.
#[derive(Clone)]
pub struct ScriptService {
    cache: ScriptCache,
    registry: DynamicEndpointRegistry,
    client: UpstreamClient,
    /// When false, script bodies proxy byte-identical to upstream.
    rewrite_enabled: bool,
    /// Extraction bypass threshold (bytes).
    script_size_limit: usize,
    /// Absolute base for minted URLs when no request host is available.
    worker_base_url: Option<String>,
}

/// A script response plus the cache-status marker for `X-Cache-Status`.
#[derive(Debug)]
pub struct ServedScript {
    pub script: ProcessedScript,
    pub cache_status: &'static str,
}

impl ScriptService {
    pub fn new(
        cache: ScriptCache,
        registry: DynamicEndpointRegistry,
        client: UpstreamClient,
        rewrite_enabled: bool,
        script_size_limit: usize,
        worker_base_url: Option<String>,
    ) -> Self {
        Self {
            cache,
            registry,
            client,
            rewrite_enabled,
            script_size_limit,
            worker_base_url,
        }
    }

    pub fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    /// Base URL minted into rewritten script bodies. The configured worker
    /// base wins; a request-derived base is the fallback so interactive
    /// traffic works unconfigured. Scheduled refreshes have no request to
    /// fall back to.
    fn mint_base(&self, request_base: Option<&str>) -> String {
        self.worker_base_url
            .clone()
            .or_else(|| request_base.map(|s| s.trim_end_matches('/').to_string()))
            .unwrap_or_default()
    }

    /// Serve a script by key: fresh cache, stale cache, or a coalesced
    /// on-demand fetch through the rewrite pipeline.
    pub async fn serve(
        &self,
        key: &ScriptKey,
        upstream_url: &str,
        incoming_headers: &HeaderMap,
        request_base: Option<&str>,
        force_refresh: bool,
    ) -> Result<ServedScript, ProxyError> {
        if !force_refresh {
            if let Some(hit) = self.cache.get(key).await {
                let cache_status = match hit.status {
                    CacheStatus::Fresh => CACHE_STATUS_HIT_SCRIPT,
                    CacheStatus::Stale => CACHE_STATUS_STALE,
                };
                return Ok(ServedScript {
                    script: hit.script,
                    cache_status,
                });
            }
        }

        let base = self.mint_base(request_base);
        let service = self.clone();
        let fetch_key = key.clone();
        let url = upstream_url.to_string();
        let headers = build_upstream_headers(incoming_headers, UpstreamMode::Minimal, None);

        let script = self
            .cache
            .fetch_coalesced(key, move || async move {
                let processed = service.fetch_and_process(&fetch_key, &url, headers, &base).await?;
                service.cache.store(&fetch_key, &processed, true).await;
                Ok(processed)
            })
            .await?;

        Ok(ServedScript {
            script,
            cache_status: CACHE_STATUS_MISS,
        })
    }

    /// Scheduled-refresh path: fetch, process, and write the triple with
    /// updated/refreshed provenance from the hash comparison.
    pub async fn refresh(
        &self,
        key: &ScriptKey,
        upstream_url: &str,
    ) -> Result<RefreshOutcome, ProxyError> {
        let base = self.mint_base(None);
        let processed = self
            .fetch_and_process(key, upstream_url, HeaderMap::new(), &base)
            .await?;
        let outcome = self.cache.store_compared(key, &processed).await;
        info!(script = %key, outcome = ?outcome, "Scheduled script refresh");
        Ok(outcome)
    }

    async fn fetch_and_process(
        &self,
        key: &ScriptKey,
        upstream_url: &str,
        headers: HeaderMap,
        base: &str,
    ) -> Result<ProcessedScript, ProxyError> {
        let upstream = self
            .client
            .fetch(Method::GET, upstream_url, headers, None)
            .await?;

        if !upstream.status.is_success() {
            return Err(ProxyError::UpstreamHttp(format!(
                "{} from {upstream_url}",
                upstream.status
            )));
        }

        let content_type = upstream
            .content_type
            .clone()
            .or_else(|| Some("application/javascript".to_string()));

        let body = self.process_body(key, upstream.body, base).await;
        Ok(ProcessedScript { body, content_type })
    }

    /// Rewrite a script body so embedded tracker URLs point back at this
    /// proxy. Bodies that are disabled, binary, oversized, or URL-free pass
    /// through unmodified. The processed body IS the canonical output
    /// either way, and it is what gets hashed and cached.
    async fn process_body(&self, key: &ScriptKey, body: Bytes, base: &str) -> Bytes {
        if !self.rewrite_enabled {
            return body;
        }
        let Ok(text) = std::str::from_utf8(&body) else {
            warn!(script = %key, "Script body is not UTF-8 — proxying unmodified");
            return body;
        };

        let opts = ExtractOptions {
            max_script_bytes: self.script_size_limit,
            mode: FilterMode::AllExternal,
        };
        let urls = extract_urls(text, &opts);
        if urls.is_empty() {
            return body;
        }

        let endpoints = self.registry.batch_create(&urls).await;
        let replacements: HashMap<String, String> = endpoints
            .into_iter()
            .map(|(url, endpoint)| (url, format!("{base}{}", endpoint.proxy_path)))
            .collect();

        debug!(
            script = %key,
            urls = urls.len(),
            rewritten = replacements.len(),
            "Script rewrite"
        );

        let rewritten = rewrite_script(text, &replacements);
        self.cache.record_backrefs(key, &urls);
        Bytes::from(rewritten)
    }

    /// Heal a lookup for an unknown dynamic UUID using the referring script.
    ///
    /// Rotation flips can leave a client running a cached script that embeds
    /// UUIDs whose registry entries have expired. Re-extracting the referring
    /// script's URLs re-derives the same UUIDs (they are pure functions of
    /// the URL), repopulating the registry. If the UUID is still unknown the
    /// script itself is out of date, so its cache entry is dropped.
    pub async fn recover_unknown_uuid(
        &self,
        uuid: &str,
        referer_key: &ScriptKey,
    ) -> Option<String> {
        let hit = self.cache.get(referer_key).await?;

        // The cached body is already rewritten, so its original URLs come
        // from the backref record. Re-extraction is the fallback for bodies
        // whose backrefs were evicted; minted /x/ paths are filtered out so
        // recovery never registers endpoints pointing at this proxy itself.
        let mut urls = self.cache.urls_for_script(referer_key);
        if urls.is_empty() {
            if let Ok(text) = std::str::from_utf8(&hit.script.body) {
                let opts = ExtractOptions {
                    max_script_bytes: self.script_size_limit,
                    mode: FilterMode::AllExternal,
                };
                urls = extract_urls(text, &opts)
                    .into_iter()
                    .filter(|url| !is_minted_proxy_url(url))
                    .collect();
            }
        }
        if !urls.is_empty() {
            self.registry.batch_create(&urls).await;
        }

        match self.registry.get_target_url(uuid).await {
            Some(target) => {
                info!(uuid = %uuid, script = %referer_key, "Recovered dynamic endpoint from referring script");
                Some(target)
            }
            None => {
                warn!(uuid = %uuid, script = %referer_key, "Recovery failed — invalidating referring script");
                self.cache.invalidate(referer_key).await;
                None
            }
        }
    }
}

/// True for URLs whose path is one of our own minted dynamic endpoints.
fn is_minted_proxy_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let mut segments = match parsed.path_segments() {
        Some(segments) => segments,
        None => return false,
    };
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some("x"), Some(uuid), None) if crate::endpoints::is_valid_uuid_segment(uuid)
    )
}
