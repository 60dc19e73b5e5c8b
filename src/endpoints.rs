use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{Future, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::api::error::ProxyError;
use crate::cache::script::ScriptCache;
use crate::cache::{cache_key, CacheLayer, BUCKET_DYN_ENDPOINT, BUCKET_DYN_URL_INDEX};
use crate::crypto::sha256_hex;

/// Dynamic-endpoint entries outlive the stale script TTL (7 d) so that URLs
/// referenced inside any still-servable cached script keep resolving.
const DYN_ENDPOINT_TTL_SECS: u64 = 14 * 24 * 60 * 60;

/// Upper bound on concurrent upstream-independent creations in a batch.
const BATCH_CONCURRENCY: usize = 10;

/// A minted obfuscated endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicEndpoint {
    pub uuid: String,
    pub proxy_path: String,
}

type CreateFuture = Shared<Pin<Box<dyn Future<Output = DynamicEndpoint> + Send>>>;

/// Strip query and fragment from a URL. UUIDs are derived from this form so
/// that every query variant of one endpoint shares a single mapping.
pub fn normalize_url(url: &str) -> Option<String> {
    let mut parsed = url::Url::parse(url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

/// Deterministic UUID for a normalized URL: first 32 hex chars of its SHA-256.
pub fn uuid_for_url(normalized: &str) -> String {
    let mut uuid = sha256_hex(normalized.as_bytes());
    uuid.truncate(32);
    uuid
}

/// A path UUID the router will accept: lower-hex, length 12–64.
pub fn is_valid_uuid_segment(segment: &str) -> bool {
    (12..=64).contains(&segment.len())
        && segment
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Bidirectional URL ⇄ UUID registry backed by the shared cache.
///
/// Primary key: uuid → URL. Secondary index: hash(URL) → uuid, which makes
/// reuse checks O(1) without scanning. Because the UUID is a pure function
/// of the URL, recreation after eviction is automatic and idempotent.
///
/// Cloning is cheap — clones share the same underlying maps via Arc.
#[derive(Clone)]
pub struct DynamicEndpointRegistry {
    cache: CacheLayer,
    /// In-flight creations keyed by normalized URL. Concurrent creators for
    /// one URL share a single future and produce one set of cache writes.
    pending: Arc<DashMap<String, CreateFuture>>,
    /// Script cache handle for cascade invalidation when a URL's UUID moves.
    scripts: Option<ScriptCache>,
}

impl DynamicEndpointRegistry {
    pub fn new(cache: CacheLayer) -> Self {
        Self {
            cache,
            pending: Arc::new(DashMap::new()),
            scripts: None,
        }
    }

    /// Attach the script cache so moved mappings cascade-invalidate the
    /// scripts that embed them.
    pub fn with_script_cache(mut self, scripts: ScriptCache) -> Self {
        self.scripts = Some(scripts);
        self
    }

    /// Mint (or re-derive) the endpoint for a URL.
    pub async fn create(&self, raw_url: &str) -> Result<DynamicEndpoint, ProxyError> {
        let normalized = normalize_url(raw_url)
            .ok_or_else(|| ProxyError::BadRequest(format!("not a proxyable URL: {raw_url}")))?;

        let fut = match self.pending.entry(normalized.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let registry = self.clone();
                let key = normalized.clone();
                let fut: CreateFuture = async move {
                    let endpoint = registry.create_inner(&key).await;
                    // Cleanup runs whether the write path was taken or not;
                    // every waiter already holds a clone of the shared future.
                    registry.pending.remove(&key);
                    endpoint
                }
                .boxed()
                .shared();
                v.insert(fut.clone());
                fut
            }
        };

        Ok(fut.await)
    }

    async fn create_inner(&self, normalized: &str) -> DynamicEndpoint {
        let index_key = cache_key(BUCKET_DYN_URL_INDEX, &sha256_hex(normalized.as_bytes()));
        let uuid = uuid_for_url(normalized);

        // Reuse check through the secondary index: an existing mapping means
        // no writes at all this call.
        if let Some(existing) = self.cache.get(&index_key).await {
            let stored = String::from_utf8_lossy(&existing.body).to_string();
            if stored == uuid {
                return DynamicEndpoint {
                    proxy_path: format!("/x/{uuid}"),
                    uuid,
                };
            }
            // Derivation moved (deploy changed normalization rules): cached
            // scripts still embed the old UUID, so cascade-invalidate them
            // before rewriting the mapping.
            warn!(url = %normalized, old = %stored, new = %uuid, "Dynamic UUID moved");
            self.cache
                .delete(&cache_key(BUCKET_DYN_ENDPOINT, &stored))
                .await;
            if let Some(scripts) = &self.scripts {
                let dropped = scripts.invalidate_for_url(normalized).await;
                if dropped > 0 {
                    warn!(url = %normalized, dropped, "Invalidated scripts embedding moved UUID");
                }
            }
        }
        self.cache
            .put(
                cache_key(BUCKET_DYN_ENDPOINT, &uuid),
                Bytes::from(normalized.to_string()),
                None,
                DYN_ENDPOINT_TTL_SECS,
            )
            .await;
        self.cache
            .put(
                index_key,
                Bytes::from(uuid.clone()),
                None,
                DYN_ENDPOINT_TTL_SECS,
            )
            .await;

        debug!(uuid = %uuid, url = %normalized, "Dynamic endpoint created");
        DynamicEndpoint {
            proxy_path: format!("/x/{uuid}"),
            uuid,
        }
    }

    /// Resolve a UUID back to its target URL. `None` if the mapping is
    /// unknown or expired.
    pub async fn get_target_url(&self, uuid: &str) -> Option<String> {
        self.cache
            .get(&cache_key(BUCKET_DYN_ENDPOINT, uuid))
            .await
            .map(|entry| String::from_utf8_lossy(&entry.body).to_string())
    }

    /// Mint endpoints for many URLs with bounded concurrency. Per-URL
    /// failures are logged and dropped; the result is the partial map of
    /// successes keyed by the input URL.
    pub async fn batch_create(&self, urls: &[String]) -> HashMap<String, DynamicEndpoint> {
        stream::iter(urls.iter().cloned())
            .map(|url| {
                let registry = self.clone();
                async move {
                    let result = registry.create(&url).await;
                    (url, result)
                }
            })
            .buffer_unordered(BATCH_CONCURRENCY)
            .filter_map(|(url, result)| async move {
                match result {
                    Ok(endpoint) => Some((url, endpoint)),
                    Err(e) => {
                        warn!(url = %url, error = %e, "Skipping endpoint in batch create");
                        None
                    }
                }
            })
            .collect()
            .await
    }
}
