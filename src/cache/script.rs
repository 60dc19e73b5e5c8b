use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{Future, FutureExt, Shared};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::api::error::ProxyError;
use crate::cache::{
    cache_key, CacheLayer, BUCKET_SCRIPT, BUCKET_SCRIPT_HASH, BUCKET_SCRIPT_STALE,
};
use crate::crypto::sha256_hex;

/// Fresh TTL for scheduled refreshes: the 12h cadence re-arms it long before expiry.
const FRESH_TTL_SCHEDULED_SECS: u64 = 24 * 60 * 60;
/// Fresh TTL for on-demand (container-specific) fetches.
const FRESH_TTL_ON_DEMAND_SECS: u64 = 12 * 60 * 60;
/// Stale entries survive a week of failed refreshes before the cache goes cold.
const STALE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// URL-backref bookkeeping caps.
const BACKREF_MAX_URLS: usize = 10_000;
const BACKREF_EVICT_FRACTION: usize = 5; // evict 1/5 (20%) oldest when full

/// Container IDs accepted into cache keys. Anything else would let clients
/// mint unbounded keys.
static CONTAINER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(GTM|G|GT|AW|DC)-[A-Z0-9]{6,12}$").expect("container id regex"));

/// Well-known scripts refreshed on the scheduled cadence.
pub const WELL_KNOWN_SCRIPTS: &[(&str, &str)] = &[
    ("fbevents", "https://connect.facebook.net/en_US/fbevents.js"),
    ("gtag", "https://www.googletagmanager.com/gtag/js"),
];

pub fn well_known_url(name: &str) -> Option<&'static str> {
    WELL_KNOWN_SCRIPTS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, url)| *url)
}

/// Logical identity of a cached upstream script: a bare name (`fbevents`)
/// or a container-qualified composite (`gtm:GTM-ABC123`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptKey(String);

impl ScriptKey {
    pub fn named(name: &str) -> Self {
        Self(name.to_string())
    }

    /// Container-qualified key. The ID must match the provider pattern;
    /// fabricated IDs are refused rather than given a cache key.
    pub fn container(kind: &str, id: &str) -> Result<Self, ProxyError> {
        if !CONTAINER_ID_RE.is_match(id) {
            return Err(ProxyError::BadRequest(format!(
                "invalid container id: {id}"
            )));
        }
        Ok(Self(format!("{kind}:{id}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upstream URL this key resolves to, when derivable from the key alone.
    pub fn upstream_url(&self) -> Option<String> {
        match self.0.split_once(':') {
            None => well_known_url(&self.0).map(|u| u.to_string()),
            Some(("gtm", id)) => {
                Some(format!("https://www.googletagmanager.com/gtm.js?id={id}"))
            }
            Some(("gtag", id)) => {
                Some(format!("https://www.googletagmanager.com/gtag/js?id={id}"))
            }
            Some(_) => None,
        }
    }
}

impl std::fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Freshness of a served cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Fresh,
    Stale,
}

/// A script body as served to clients: already rewritten, hash-consistent.
#[derive(Debug, Clone)]
pub struct ProcessedScript {
    pub body: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScriptHit {
    pub script: ProcessedScript,
    pub status: CacheStatus,
}

/// Outcome of a scheduled refresh for one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Content hash changed, new body written.
    Updated,
    /// Same hash, triple rewritten to extend TTLs.
    Refreshed,
}

type FetchFuture = Shared<Pin<Box<dyn Future<Output = Result<ProcessedScript, ProxyError>> + Send>>>;

/// URL → referring-script index, insertion-ordered for oldest-first eviction.
#[derive(Default)]
struct BackrefIndex {
    by_url: HashMap<String, HashSet<ScriptKey>>,
    order: VecDeque<String>,
}

impl BackrefIndex {
    fn record(&mut self, key: &ScriptKey, urls: &[String]) {
        for url in urls {
            match self.by_url.get_mut(url) {
                Some(scripts) => {
                    scripts.insert(key.clone());
                }
                None => {
                    self.by_url
                        .insert(url.clone(), HashSet::from([key.clone()]));
                    self.order.push_back(url.clone());
                }
            }
        }

        if self.by_url.len() > BACKREF_MAX_URLS {
            let evict = BACKREF_MAX_URLS / BACKREF_EVICT_FRACTION;
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.by_url.remove(&old);
                }
            }
        }
    }

    fn take_scripts(&mut self, url: &str) -> Vec<ScriptKey> {
        match self.by_url.remove(url) {
            Some(scripts) => {
                self.order.retain(|u| u != url);
                scripts.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    fn urls_for(&self, key: &ScriptKey) -> Vec<String> {
        self.by_url
            .iter()
            .filter(|(_, scripts)| scripts.contains(key))
            .map(|(url, _)| url.clone())
            .collect()
    }
}

/// Fresh + stale + hash triple cache with stale-while-revalidate reads.
///
/// The host cache knows only TTLs, so staleness is modeled as two distinct
/// entries rather than per-entry metadata. A write issues all three puts
/// together before the writer proceeds; concurrent readers during the write
/// window may observe any subset, each independently consistent.
///
/// Cloning is cheap — clones share the same underlying maps via Arc.
#[derive(Clone)]
pub struct ScriptCache {
    cache: CacheLayer,
    /// In-flight upstream fetches keyed by script key. Within one instance,
    /// concurrent requesters for the same key share a single upstream call.
    pending: Arc<dashmap::DashMap<String, FetchFuture>>,
    backrefs: Arc<Mutex<BackrefIndex>>,
}

impl ScriptCache {
    pub fn new(cache: CacheLayer) -> Self {
        Self {
            cache,
            pending: Arc::new(dashmap::DashMap::new()),
            backrefs: Arc::new(Mutex::new(BackrefIndex::default())),
        }
    }

    /// Fresh if present, else stale, else miss. Never blocks on writers.
    pub async fn get(&self, key: &ScriptKey) -> Option<ScriptHit> {
        if let Some(entry) = self.cache.get(&cache_key(BUCKET_SCRIPT, key.as_str())).await {
            return Some(ScriptHit {
                script: ProcessedScript {
                    body: entry.body,
                    content_type: entry.content_type,
                },
                status: CacheStatus::Fresh,
            });
        }
        if let Some(entry) = self
            .cache
            .get(&cache_key(BUCKET_SCRIPT_STALE, key.as_str()))
            .await
        {
            return Some(ScriptHit {
                script: ProcessedScript {
                    body: entry.body,
                    content_type: entry.content_type,
                },
                status: CacheStatus::Stale,
            });
        }
        None
    }

    /// Content hash recorded for the current fresh body, if any.
    pub async fn stored_hash(&self, key: &ScriptKey) -> Option<String> {
        self.cache
            .get(&cache_key(BUCKET_SCRIPT_HASH, key.as_str()))
            .await
            .map(|entry| String::from_utf8_lossy(&entry.body).to_string())
    }

    /// Write the fresh/stale/hash triple for a processed body. All three
    /// puts are issued together; the hash matches the fresh body exactly.
    /// Returns the content hash.
    pub async fn store(&self, key: &ScriptKey, script: &ProcessedScript, on_demand: bool) -> String {
        let hash = sha256_hex(&script.body);
        let fresh_ttl = if on_demand {
            FRESH_TTL_ON_DEMAND_SECS
        } else {
            FRESH_TTL_SCHEDULED_SECS
        };

        tokio::join!(
            self.cache.put(
                cache_key(BUCKET_SCRIPT, key.as_str()),
                script.body.clone(),
                script.content_type.clone(),
                fresh_ttl,
            ),
            self.cache.put(
                cache_key(BUCKET_SCRIPT_STALE, key.as_str()),
                script.body.clone(),
                script.content_type.clone(),
                STALE_TTL_SECS,
            ),
            self.cache.put(
                cache_key(BUCKET_SCRIPT_HASH, key.as_str()),
                Bytes::from(hash.clone()),
                None,
                fresh_ttl,
            ),
        );

        debug!(script = %key, hash = %hash, on_demand, "Script triple written");
        hash
    }

    /// Store a refreshed body, comparing its hash against the stored one.
    pub async fn store_compared(&self, key: &ScriptKey, script: &ProcessedScript) -> RefreshOutcome {
        let previous = self.stored_hash(key).await;
        let hash = self.store(key, script, false).await;
        match previous {
            Some(prev) if prev == hash => RefreshOutcome::Refreshed,
            _ => RefreshOutcome::Updated,
        }
    }

    /// Delete fresh, stale and hash entries together.
    pub async fn invalidate(&self, key: &ScriptKey) {
        let key_fresh = cache_key(BUCKET_SCRIPT, key.as_str());
        let key_stale = cache_key(BUCKET_SCRIPT_STALE, key.as_str());
        let key_hash = cache_key(BUCKET_SCRIPT_HASH, key.as_str());
        tokio::join!(
            self.cache.delete(&key_fresh),
            self.cache.delete(&key_stale),
            self.cache.delete(&key_hash),
        );
        info!(script = %key, "Script cache invalidated");
    }

    /// Remember which upstream URLs a cached script embeds, for cascade
    /// invalidation when a URL's dynamic mapping has to move.
    pub fn record_backrefs(&self, key: &ScriptKey, urls: &[String]) {
        if urls.is_empty() {
            return;
        }
        let mut index = self.backrefs.lock().expect("backref index poisoned");
        index.record(key, urls);
    }

    /// Upstream URLs recorded as embedded in a cached script.
    pub fn urls_for_script(&self, key: &ScriptKey) -> Vec<String> {
        let index = self.backrefs.lock().expect("backref index poisoned");
        index.urls_for(key)
    }

    /// Invalidate every cached script that embedded `url`. Returns how many
    /// scripts were dropped.
    pub async fn invalidate_for_url(&self, url: &str) -> usize {
        let scripts = {
            let mut index = self.backrefs.lock().expect("backref index poisoned");
            index.take_scripts(url)
        };
        for key in &scripts {
            self.invalidate(key).await;
        }
        scripts.len()
    }

    /// Run `fetch` for this key unless an identical fetch is already in
    /// flight, in which case await the shared outcome. Exactly one upstream
    /// request is issued per key per flight; the map entry is cleaned up on
    /// success and failure alike.
    pub async fn fetch_coalesced<F, Fut>(
        &self,
        key: &ScriptKey,
        fetch: F,
    ) -> Result<ProcessedScript, ProxyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProcessedScript, ProxyError>> + Send + 'static,
    {
        let fut = match self.pending.entry(key.as_str().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let pending = Arc::clone(&self.pending);
                let map_key = key.as_str().to_string();
                let inner = fetch();
                let fut: FetchFuture = async move {
                    let result = inner.await;
                    pending.remove(&map_key);
                    result
                }
                .boxed()
                .shared();
                v.insert(fut.clone());
                fut
            }
        };
        fut.await
    }
}
