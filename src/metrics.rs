use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Point-in-time counter snapshot, embedded in the /health body.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub script_cache_hits: u64,
    pub rate_limited: u64,
    pub upstream_errors: u64,
}

#[derive(Default)]
struct Counters {
    requests_total: AtomicU64,
    script_cache_hits: AtomicU64,
    rate_limited: AtomicU64,
    upstream_errors: AtomicU64,
}

/// Per-process request counters. Cloning is cheap — clones share the same
/// counters via Arc.
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.counters.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_script_cache_hit(&self) {
        self.counters
            .script_cache_hits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.counters.requests_total.load(Ordering::Relaxed),
            script_cache_hits: self.counters.script_cache_hits.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            upstream_errors: self.counters.upstream_errors.load(Ordering::Relaxed),
        }
    }
}
