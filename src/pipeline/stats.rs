use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Usage counters shared across concurrent pipeline runs.
/// Incremented with relaxed atomics; exactness under contention is not a
/// requirement, monotonicity is.
#[derive(Debug, Default)]
pub struct UsageStats {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    cache_hits: AtomicU64,
    fallback_passes: AtomicU64,
    provider_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub cache_hits: u64,
    pub fallback_passes: u64,
    pub provider_failures: u64,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_pass(&self) {
        self.fallback_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_failures(&self, count: u64) {
        self.provider_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fallback_passes: self.fallback_passes.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
        }
    }
}
