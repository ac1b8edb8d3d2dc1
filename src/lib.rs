//! Sitescope turns unreliable contractor input — job-site photos plus
//! free-text notes — into a structured project specification a pricing
//! engine can consume. The core is a resilient multi-stage analysis
//! pipeline: retried analyzer calls with backoff, heuristic fallbacks when
//! providers fail, a confidence score over its own output, and caching of
//! successful runs.

pub mod config;
pub mod pipeline;

pub use config::PipelineConfig;
pub use pipeline::cache::{CacheStore, MemoryCacheStore};
pub use pipeline::ledger::{RunLedgerStore, StageName};
pub use pipeline::ollama::OllamaAnalyzer;
pub use pipeline::orchestrator::AnalysisPipeline;
pub use pipeline::types::{
    AnalysisOptions, AnalysisRequest, ImageKind, ImageSource, MaterialsLookup, ProjectImage,
    ProjectLocation, ProjectSpec, TextAnalyzer, VisionAnalyzer,
};
pub use pipeline::{AnalysisError, ProviderErrorKind};

use tracing_subscriber::EnvFilter;

/// Initialize tracing for binaries embedding the pipeline. Idempotent —
/// repeated calls (e.g. across tests) are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
