//! End-to-end pipeline orchestration.
//!
//! One run walks the fixed stage sequence, threading immutable snapshots
//! between stages. An unrecovered stage failure triggers exactly one
//! fallback pass that resumes from the last completed stage, reusing the
//! outputs the primary pass already produced — completed stages and their
//! side effects are never re-executed. A second failure is terminal and
//! surfaces both causes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

use super::cache::{cache_key, CacheStore, MemoryCacheStore};
use super::combine::combine_findings;
use super::confidence::compute_confidence;
use super::image_analysis::ImageAnalysisStage;
use super::ledger::{RunLedger, RunLedgerStore, StageName};
use super::notes_analysis::NotesAnalysisStage;
use super::specialized::{SpecializedAnalysisStage, SpecializedOutcome};
use super::stats::UsageStats;
use super::structuring::{structure_findings, StructuredCore};
use super::types::{
    AggregatedFindings, AnalysisRequest, ImageFinding, MaterialsLookup, NotesFindings,
    ProcessingMeta, ProjectImage, ProjectSpec, TextAnalyzer, VisionAnalyzer,
};
use super::AnalysisError;
use crate::config::PipelineConfig;

const SUPPORTED_MIME: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// Stage outputs accumulated across the primary pass and its fallback.
/// A populated slot means the stage completed and must not run again.
#[derive(Default)]
struct PassState {
    supported_images: Option<Vec<ProjectImage>>,
    image_findings: Option<Vec<ImageFinding>>,
    notes_findings: Option<NotesFindings>,
    aggregated: Option<AggregatedFindings>,
    core: Option<StructuredCore>,
    specialized: Option<Option<SpecializedOutcome>>,
    structuring_substituted: bool,
}

/// The resilient analysis pipeline. Collaborators are injected as trait
/// objects; the cache, ledger store, and stats are shared across runs.
pub struct AnalysisPipeline {
    vision: Arc<dyn VisionAnalyzer>,
    text_primary: Arc<dyn TextAnalyzer>,
    text_secondary: Option<Arc<dyn TextAnalyzer>>,
    materials: Option<Arc<dyn MaterialsLookup>>,
    cache: Arc<dyn CacheStore>,
    ledgers: Arc<RunLedgerStore>,
    stats: Arc<UsageStats>,
    config: PipelineConfig,
}

impl AnalysisPipeline {
    pub fn new(vision: Arc<dyn VisionAnalyzer>, text_primary: Arc<dyn TextAnalyzer>) -> Self {
        Self {
            vision,
            text_primary,
            text_secondary: None,
            materials: None,
            cache: Arc::new(MemoryCacheStore::new()),
            ledgers: Arc::new(RunLedgerStore::new()),
            stats: Arc::new(UsageStats::new()),
            config: PipelineConfig::default(),
        }
    }

    /// Different-provider backup for the notes analyzer.
    pub fn with_secondary_text(mut self, analyzer: Arc<dyn TextAnalyzer>) -> Self {
        self.text_secondary = Some(analyzer);
        self
    }

    pub fn with_materials_lookup(mut self, lookup: Arc<dyn MaterialsLookup>) -> Self {
        self.materials = Some(lookup);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stats(&self) -> Arc<UsageStats> {
        self.stats.clone()
    }

    pub fn ledgers(&self) -> Arc<RunLedgerStore> {
        self.ledgers.clone()
    }

    /// Run the full pipeline for one request. Returns exactly one spec or
    /// one error; callers see `Validation` for unusable input, `Pipeline`
    /// when both passes are exhausted.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<ProjectSpec, AnalysisError> {
        let started = Instant::now();

        // Fatal before any network or cache traffic.
        validate_request(&request)?;

        self.stats.record_run_started();
        let processing_id = request.options.processing_id.unwrap_or_else(Uuid::new_v4);
        tracing::info!(
            processing_id = %processing_id,
            images = request.images.len(),
            notes_len = request.notes.len(),
            fallback_mode = request.options.fallback_mode,
            "starting analysis run"
        );

        let key = cache_key(&request, self.config.notes_prefix_len);
        if !request.options.force_reprocess {
            if let Some(mut cached) = self.cache.get(&key).await {
                tracing::info!(processing_id = %processing_id, "cache hit, skipping analysis");
                self.stats.record_cache_hit();
                cached.meta.cache_hit = true;
                return Ok(cached);
            }
        }

        let ledger = self.ledgers.open(processing_id);
        let mut state = PassState::default();

        let primary = self
            .run_pass(
                &request,
                &ledger,
                &mut state,
                request.options.fallback_mode,
                request.options.resume_from,
            )
            .await;

        let pass_result = match primary {
            Ok(()) => Ok(false),
            // Validation failures abort outright; a fallback pass cannot fix input.
            Err(e @ AnalysisError::Validation(_)) => Err(e),
            Err(primary_err) if !request.options.fallback_mode => {
                let resume = ledger
                    .lock()
                    .expect("ledger poisoned")
                    .last_completed_stage();
                tracing::warn!(
                    processing_id = %processing_id,
                    error = %primary_err,
                    resume_from = ?resume,
                    "primary pass failed, starting fallback pass"
                );
                self.stats.record_fallback_pass();
                ledger
                    .lock()
                    .expect("ledger poisoned")
                    .warn(format!("primary pass failed: {primary_err}"));

                match self
                    .run_pass(&request, &ledger, &mut state, true, resume)
                    .await
                {
                    Ok(()) => Ok(true),
                    Err(fallback_err) => Err(AnalysisError::Pipeline {
                        primary: primary_err.to_string(),
                        fallback: fallback_err.to_string(),
                    }),
                }
            }
            Err(e) => Err(e),
        };

        let outcome = match pass_result {
            Ok(used_fallback_pass) => {
                let spec =
                    self.assemble(processing_id, &ledger, &state, used_fallback_pass, started);
                if spec.meta.completed_stages.len() == StageName::ORDERED.len() {
                    self.cache
                        .set(&key, spec.clone(), self.config.cache_ttl())
                        .await;
                }
                self.stats.record_run_completed();
                tracing::info!(
                    processing_id = %processing_id,
                    project_type = %spec.project_type,
                    confidence = spec.meta.confidence_score,
                    fallback = spec.generated_with_fallback,
                    "analysis run completed"
                );
                Ok(spec)
            }
            Err(e) => {
                tracing::error!(processing_id = %processing_id, error = %e, "analysis run failed");
                Err(e)
            }
        };

        let failures = ledger.lock().expect("ledger poisoned").errors.len() as u64;
        self.stats.record_provider_failures(failures);
        self.ledgers.remove(processing_id);
        outcome
    }

    /// One pass over the stage sequence, optionally bounded by the run
    /// deadline. Stage outputs already in `state` are reused, which is how
    /// the fallback pass skips work the primary pass finished.
    async fn run_pass(
        &self,
        request: &AnalysisRequest,
        ledger: &Arc<Mutex<RunLedger>>,
        state: &mut PassState,
        fallback_mode: bool,
        resume_from: Option<StageName>,
    ) -> Result<(), AnalysisError> {
        if let Some(stage) = resume_from {
            tracing::debug!(resume_from = %stage, fallback_mode, "pass resuming");
        }

        match self.config.run_timeout() {
            Some(limit) => {
                let fut = self.run_stages(request, ledger, state, fallback_mode);
                match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(AnalysisError::DeadlineExceeded(limit.as_millis() as u64)),
                }
            }
            None => self.run_stages(request, ledger, state, fallback_mode).await,
        }
    }

    async fn run_stages(
        &self,
        request: &AnalysisRequest,
        ledger: &Arc<Mutex<RunLedger>>,
        state: &mut PassState,
        fallback_mode: bool,
    ) -> Result<(), AnalysisError> {
        if state.supported_images.is_none() {
            ledger
                .lock()
                .expect("ledger poisoned")
                .stage_started(StageName::Validation);
            match validate_request(request) {
                Ok((supported, warnings)) => {
                    let mut guard = ledger.lock().expect("ledger poisoned");
                    for w in warnings {
                        guard.warn(w);
                    }
                    guard.stage_completed(StageName::Validation);
                    drop(guard);
                    state.supported_images = Some(supported);
                }
                Err(e) => {
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .stage_failed(StageName::Validation, &e.to_string());
                    return Err(e);
                }
            }
        }
        let images = state
            .supported_images
            .clone()
            .expect("validation just populated the image list");

        if state.image_findings.is_none() {
            ledger
                .lock()
                .expect("ledger poisoned")
                .stage_started(StageName::ImageAnalysis);
            let stage = ImageAnalysisStage::new(self.vision.clone(), &self.config);
            match stage.run(&images, fallback_mode, ledger).await {
                Ok(findings) => {
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .stage_completed(StageName::ImageAnalysis);
                    state.image_findings = Some(findings);
                }
                Err(e) => {
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .stage_failed(StageName::ImageAnalysis, &e.to_string());
                    return Err(e);
                }
            }
        }

        if state.notes_findings.is_none() {
            ledger
                .lock()
                .expect("ledger poisoned")
                .stage_started(StageName::NotesAnalysis);
            let stage = NotesAnalysisStage::new(
                self.text_primary.clone(),
                self.text_secondary.clone(),
                &self.config,
            );
            match stage.run(&request.notes, fallback_mode, ledger).await {
                Ok(findings) => {
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .stage_completed(StageName::NotesAnalysis);
                    state.notes_findings = Some(findings);
                }
                Err(e) => {
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .stage_failed(StageName::NotesAnalysis, &e.to_string());
                    return Err(e);
                }
            }
        }

        if state.aggregated.is_none() {
            let mut guard = ledger.lock().expect("ledger poisoned");
            guard.stage_started(StageName::Combination);
            let aggregated = combine_findings(
                state
                    .image_findings
                    .as_ref()
                    .expect("image stage completed"),
                state.notes_findings.as_ref().expect("notes stage completed"),
            );
            guard.stage_completed(StageName::Combination);
            drop(guard);
            state.aggregated = Some(aggregated);
        }

        if state.core.is_none() {
            ledger
                .lock()
                .expect("ledger poisoned")
                .stage_started(StageName::Structuring);
            let aggregated = state.aggregated.as_ref().expect("combination completed");
            match structure_findings(aggregated) {
                Ok(core) => {
                    let mut guard = ledger.lock().expect("ledger poisoned");
                    for w in &core.warnings {
                        guard.warn(w.clone());
                    }
                    guard.stage_completed(StageName::Structuring);
                    drop(guard);
                    state.core = Some(core);
                }
                Err(e) if !fallback_mode => {
                    let mut guard = ledger.lock().expect("ledger poisoned");
                    guard.warn(format!("structuring failed ({e}), substituted minimal spec"));
                    guard.stage_completed(StageName::Structuring);
                    drop(guard);
                    state.core = Some(StructuredCore::minimal());
                    state.structuring_substituted = true;
                }
                Err(e) => {
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .stage_failed(StageName::Structuring, &e.to_string());
                    return Err(e);
                }
            }
        }

        if state.specialized.is_none() {
            ledger
                .lock()
                .expect("ledger poisoned")
                .stage_started(StageName::SpecializedAnalysis);
            let stage = SpecializedAnalysisStage::new(self.vision.clone(), self.materials.clone());
            let outcome = stage
                .run(
                    state.core.as_ref().expect("structuring completed"),
                    &images,
                    &request.location,
                    ledger,
                )
                .await;
            // Optional for most project types; always counts as completed.
            ledger
                .lock()
                .expect("ledger poisoned")
                .stage_completed(StageName::SpecializedAnalysis);
            state.specialized = Some(outcome);
        }

        Ok(())
    }

    fn assemble(
        &self,
        processing_id: Uuid,
        ledger: &Arc<Mutex<RunLedger>>,
        state: &PassState,
        used_fallback_pass: bool,
        started: Instant,
    ) -> ProjectSpec {
        let (completed_stages, warnings) = {
            let guard = ledger.lock().expect("ledger poisoned");
            (guard.completed_stages(), guard.warnings.clone())
        };

        let core = state.core.clone().unwrap_or_else(StructuredCore::minimal);
        let aggregated = state.aggregated.clone().unwrap_or_default();
        let notes = state.notes_findings.clone().unwrap_or_default();

        let confidence_score = compute_confidence(
            completed_stages.len(),
            StageName::ORDERED.len(),
            &core,
            !aggregated.merged.materials.is_empty(),
            aggregated.coherence_score,
        );

        let mut options: HashMap<String, serde_json::Value> = HashMap::new();
        options.insert(
            "demolitionNeeded".to_string(),
            serde_json::json!(core.demolition_needed),
        );
        options.insert(
            "materials".to_string(),
            serde_json::json!(aggregated.merged.materials),
        );
        options.insert("notesSource".to_string(), serde_json::json!(notes.source));
        options.insert(
            "coherenceScore".to_string(),
            serde_json::json!(aggregated.coherence_score),
        );
        options.insert(
            "imageFindings".to_string(),
            serde_json::to_value(&aggregated.from_images).unwrap_or(serde_json::Value::Null),
        );

        let mut detected_elements = core.detected_elements.clone();
        let specialized = state.specialized.clone().flatten();
        if let Some(outcome) = &specialized {
            for e in &outcome.extra_elements {
                if !detected_elements
                    .iter()
                    .any(|seen| seen.eq_ignore_ascii_case(e))
                {
                    detected_elements.push(e.clone());
                }
            }
        }

        let (material_availability, purchase_order_draft) = match specialized {
            Some(outcome) => (outcome.material_availability, outcome.purchase_order_draft),
            None => (None, None),
        };
        let recommended_products = material_availability
            .as_ref()
            .map(|a| a.recommended_products.clone())
            .unwrap_or_default();

        ProjectSpec {
            project_type: core.project_type,
            project_subtype: core.project_subtype,
            dimensions: core.dimensions,
            options,
            detected_elements,
            material_availability,
            recommended_products,
            purchase_order_draft,
            generated_with_fallback: used_fallback_pass || state.structuring_substituted,
            meta: ProcessingMeta {
                processing_id,
                completed_stages,
                processing_ms: started.elapsed().as_millis() as u64,
                confidence_score,
                cache_hit: false,
                warnings,
            },
        }
    }
}

/// Check the request shape: at least one image, at least one in a format
/// the vision analyzers accept. Unsupported images are dropped with a
/// warning rather than failing the run.
fn validate_request(
    request: &AnalysisRequest,
) -> Result<(Vec<ProjectImage>, Vec<String>), AnalysisError> {
    if request.images.is_empty() {
        return Err(AnalysisError::Validation("no images supplied".into()));
    }

    let mut supported = Vec::with_capacity(request.images.len());
    let mut warnings = Vec::new();
    for image in &request.images {
        if SUPPORTED_MIME.contains(&image.mime_type.to_lowercase().as_str()) {
            supported.push(image.clone());
        } else {
            warnings.push(format!(
                "image {} skipped: unsupported format {}",
                image.id, image.mime_type
            ));
        }
    }

    if supported.is_empty() {
        return Err(AnalysisError::Validation(
            "no supported image format among supplied images".into(),
        ));
    }
    Ok((supported, warnings))
}
