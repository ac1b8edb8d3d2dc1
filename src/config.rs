use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::retry::RetryPolicy;

/// Tunable bounds for one pipeline instance. Defaults match production;
/// tests shrink the delays to keep the suite fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Analyzer attempts per stage call, including the first.
    pub max_attempts: u32,
    /// Base backoff delay; doubles per retry.
    pub base_delay_ms: u64,
    /// Upper bound on random jitter added to each backoff delay.
    pub max_jitter_ms: u64,
    /// Images analyzed concurrently per batch.
    pub image_batch_size: usize,
    /// Pause between image batches, as rate-limit courtesy to the provider.
    pub batch_pause_ms: u64,
    /// How long a cached result stays valid.
    pub cache_ttl_secs: u64,
    /// How many leading characters of the notes participate in cache keying.
    pub notes_prefix_len: usize,
    /// Optional deadline for a single pass; `None` disables it.
    pub run_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_jitter_ms: 500,
            image_batch_size: 3,
            batch_pause_ms: 500,
            cache_ttl_secs: 3_600,
            notes_prefix_len: 200,
            run_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Variant with all waits collapsed to ~zero, for tests.
    pub fn fast() -> Self {
        Self {
            base_delay_ms: 1,
            max_jitter_ms: 1,
            batch_pause_ms: 1,
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}
