pub mod script;

use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

/// Private key namespace. Synthesized keys live under this origin so they can
/// never collide with a real upstream URL used as a cache key.
const KEY_ORIGIN: &str = "https://cache.internal";

/// Cache key buckets.
pub const BUCKET_SCRIPT: &str = "script";
pub const BUCKET_SCRIPT_STALE: &str = "script-stale";
pub const BUCKET_SCRIPT_HASH: &str = "script-hash";
pub const BUCKET_DYN_ENDPOINT: &str = "dyn-endpoint";
pub const BUCKET_DYN_URL_INDEX: &str = "dyn-url-index";

/// Synthesize an absolute-URL cache key under the private namespace.
pub fn cache_key(bucket: &str, id: &str) -> String {
    format!("{KEY_ORIGIN}/{bucket}/{id}")
}

/// Key for a per-IP rate bucket.
pub fn rate_limit_key(ip: &str, group: &str) -> String {
    format!("ratelimit:{ip}:{group}")
}

/// A value stored in the shared cache. Cloning is cheap (`Bytes` is refcounted).
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Stamped at put time from the entry's TTL.
    pub cache_control: String,
    pub ttl: Duration,
}

/// Per-entry TTL policy: each entry carries its own lifetime, set at put time.
struct PerEntryExpiry;

impl Expiry<String, CachedEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Typed TTL cache shared by every request task in this instance.
///
/// No locking around writers: concurrent puts for the same key race and the
/// last write wins. Values are idempotent functions of their inputs, so any
/// winner is correct.
///
/// Cloning is cheap — clones share the same underlying store.
#[derive(Clone)]
pub struct CacheLayer {
    inner: Cache<String, CachedEntry>,
}

impl CacheLayer {
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryExpiry)
            .build();
        Self { inner }
    }

    pub async fn get(&self, key: &str) -> Option<CachedEntry> {
        self.inner.get(key).await
    }

    /// Store a value with the given TTL. The entry's `Cache-Control` is
    /// stamped here so every consumer serves a consistent directive.
    pub async fn put(&self, key: String, body: Bytes, content_type: Option<String>, ttl_secs: u64) {
        let entry = CachedEntry {
            body,
            content_type,
            cache_control: format!("public, max-age={ttl_secs}"),
            ttl: Duration::from_secs(ttl_secs),
        };
        self.inner.insert(key, entry).await;
    }

    pub async fn delete(&self, key: &str) {
        self.inner.invalidate(key).await;
        debug!(key = %key, "Cache entry deleted");
    }

    /// Number of live entries (approximate; moka counts lazily).
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}
