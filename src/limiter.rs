use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{rate_limit_key, CacheLayer};

/// Fixed-window counter persisted through the cache layer as JSON.
#[derive(Debug, Serialize, Deserialize)]
struct RateBucket {
    count: u32,
    reset_at_ms: i64,
}

/// Outcome of a rate-limit check, carried through the pipeline so handlers
/// can emit `X-RateLimit-*` headers without re-checking.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

impl RateDecision {
    /// Whole seconds until the window resets, for `Retry-After`. Never below 1.
    pub fn retry_after_secs(&self, now_ms: i64) -> i64 {
        (((self.reset_at_ms - now_ms) + 999) / 1000).max(1)
    }
}

/// Per-IP fixed-window rate limiter on top of the shared cache.
///
/// The read-modify-write is not atomic: a burst of concurrent requests from
/// one IP may each observe the same count and write a slightly-off result.
/// The window design tolerates the drift: the goal is abuse damping, not
/// exact accounting.
#[derive(Clone)]
pub struct RateLimiter {
    cache: CacheLayer,
    limit: u32,
    window_ms: u64,
}

impl RateLimiter {
    pub fn new(cache: CacheLayer, limit: u32, window_ms: u64) -> Self {
        Self {
            cache,
            limit,
            window_ms,
        }
    }

    /// Count one request from `ip` against the `group` window.
    ///
    /// Fails open: a bucket that cannot be decoded or re-encoded is treated
    /// as a fresh window rather than turning a cache glitch into an outage.
    pub async fn check(&self, ip: &str, group: &str) -> RateDecision {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let key = rate_limit_key(ip, group);

        let current = match self.cache.get(&key).await {
            Some(entry) => match serde_json::from_slice::<RateBucket>(&entry.body) {
                Ok(bucket) if now_ms <= bucket.reset_at_ms => Some(bucket),
                Ok(_) => None, // window elapsed
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable rate bucket — starting fresh window");
                    None
                }
            },
            None => None,
        };

        match current {
            None => {
                let bucket = RateBucket {
                    count: 1,
                    reset_at_ms: now_ms + self.window_ms as i64,
                };
                self.write_bucket(key, &bucket).await;
                RateDecision {
                    allowed: true,
                    limit: self.limit,
                    remaining: self.limit.saturating_sub(1),
                    reset_at_ms: bucket.reset_at_ms,
                }
            }
            Some(bucket) if bucket.count < self.limit => {
                let bucket = RateBucket {
                    count: bucket.count + 1,
                    reset_at_ms: bucket.reset_at_ms,
                };
                self.write_bucket(key, &bucket).await;
                RateDecision {
                    allowed: true,
                    limit: self.limit,
                    remaining: self.limit - bucket.count,
                    reset_at_ms: bucket.reset_at_ms,
                }
            }
            Some(bucket) => RateDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_at_ms: bucket.reset_at_ms,
            },
        }
    }

    async fn write_bucket(&self, key: String, bucket: &RateBucket) {
        let body = match serde_json::to_vec(bucket) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                warn!(error = %e, "Failed to encode rate bucket — allowing request");
                return;
            }
        };
        let ttl_secs = self.window_ms.div_ceil(1000).max(1);
        self.cache
            .put(key, body, Some("application/json".into()), ttl_secs)
            .await;
    }
}
