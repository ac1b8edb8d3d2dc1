//! Per-image vision analysis with batching and per-image error isolation.
//!
//! Images run in fixed-size batches: concurrent within a batch, sequential
//! between batches with a courtesy pause so upstream rate limits are
//! respected. A single bad image never fails the stage — it degrades to a
//! filename heuristic (outside fallback mode) or an errored finding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;

use super::fallback::guess_from_filename;
use super::ledger::{RunLedger, StageName};
use super::parser::{parse_finding_payload, recover_partial, RawFinding};
use super::preprocess::preprocess_image;
use super::prompt::{build_image_prompt, IMAGE_SYSTEM_PROMPT};
use super::retry::{run_with_retry, RetryPolicy};
use super::types::{ImageFinding, ImagePayload, ImageSource, ProjectImage, VisionAnalyzer};
use super::{classify_provider_message, AnalysisError};
use crate::config::PipelineConfig;

pub struct ImageAnalysisStage {
    vision: Arc<dyn VisionAnalyzer>,
    policy: RetryPolicy,
    batch_size: usize,
    batch_pause: Duration,
}

impl ImageAnalysisStage {
    pub fn new(vision: Arc<dyn VisionAnalyzer>, config: &PipelineConfig) -> Self {
        Self {
            vision,
            policy: config.retry_policy(),
            batch_size: config.image_batch_size.max(1),
            batch_pause: config.batch_pause(),
        }
    }

    /// Analyze every image, in input order. Errors only when the stage
    /// itself cannot proceed (no images); per-image failures are absorbed
    /// into their findings.
    pub async fn run(
        &self,
        images: &[ProjectImage],
        fallback_mode: bool,
        ledger: &Mutex<RunLedger>,
    ) -> Result<Vec<ImageFinding>, AnalysisError> {
        if images.is_empty() {
            return Err(AnalysisError::Validation("no images to analyze".into()));
        }

        let mut findings = Vec::with_capacity(images.len());
        for (batch_index, batch) in images.chunks(self.batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.batch_pause).await;
            }
            tracing::debug!(
                batch = batch_index,
                size = batch.len(),
                "analyzing image batch"
            );
            let batch_findings = join_all(
                batch
                    .iter()
                    .map(|image| self.analyze_one(image, fallback_mode, ledger)),
            )
            .await;
            findings.extend(batch_findings);
        }

        Ok(findings)
    }

    async fn analyze_one(
        &self,
        image: &ProjectImage,
        fallback_mode: bool,
        ledger: &Mutex<RunLedger>,
    ) -> ImageFinding {
        let payload = match prepare_payload(image).await {
            Ok((payload, warnings)) => {
                if !warnings.is_empty() {
                    let mut guard = ledger.lock().expect("ledger poisoned");
                    for w in warnings {
                        guard.warn(format!("image {}: {w}", image.id));
                    }
                }
                payload
            }
            Err(e) => {
                tracing::warn!(image_id = %image.id, error = %e, "image unusable, degrading");
                ledger
                    .lock()
                    .expect("ledger poisoned")
                    .warn(format!("image {} unusable: {e}", image.id));
                return self.degraded_finding(image, &e.to_string(), fallback_mode);
            }
        };

        let prompt = build_image_prompt(image.kind);
        let result = run_with_retry(StageName::ImageAnalysis, &self.policy, ledger, || {
            self.vision.analyze(&prompt, IMAGE_SYSTEM_PROMPT, &payload)
        })
        .await;

        match result {
            Ok(response) => self.finding_from_response(image, &response, ledger),
            Err(e) => {
                let kind = e
                    .provider_kind()
                    .unwrap_or_else(|| classify_provider_message(&e.to_string()));
                tracing::warn!(
                    image_id = %image.id,
                    kind = %kind,
                    error = %e,
                    "vision analysis failed for image"
                );
                ledger
                    .lock()
                    .expect("ledger poisoned")
                    .errors
                    .push(format!("image {}: {kind} error: {e}", image.id));
                self.degraded_finding(image, &e.to_string(), fallback_mode)
            }
        }
    }

    /// Outside fallback mode a failed image becomes a filename guess;
    /// inside fallback mode no further heuristics run and the finding just
    /// carries the error.
    fn degraded_finding(
        &self,
        image: &ProjectImage,
        error: &str,
        fallback_mode: bool,
    ) -> ImageFinding {
        if fallback_mode {
            ImageFinding {
                image_id: image.id.clone(),
                error: Some(error.to_string()),
                ..Default::default()
            }
        } else {
            let mut finding = guess_from_filename(image);
            finding.error = Some(error.to_string());
            finding
        }
    }

    fn finding_from_response(
        &self,
        image: &ProjectImage,
        response: &str,
        ledger: &Mutex<RunLedger>,
    ) -> ImageFinding {
        let raw = match parse_finding_payload(response) {
            Ok(raw) => raw,
            Err(e) => {
                ledger.lock().expect("ledger poisoned").warn(format!(
                    "image {}: analyzer response not parseable ({e}), recovered partially",
                    image.id
                ));
                recover_partial(response)
            }
        };

        let confidence = field_completeness_confidence(&raw);
        ImageFinding {
            image_id: image.id.clone(),
            project_type: raw.project_type,
            dimensions: raw.dimensions,
            materials: raw.materials,
            conditions: raw.conditions,
            special_considerations: raw.special_considerations,
            confidence,
            inferred_from_filename: false,
            error: None,
        }
    }
}

/// Confidence from field completeness: type 0.3, materials 0.2,
/// dimensions 0.3, conditions 0.1, special considerations 0.1.
pub fn field_completeness_confidence(raw: &RawFinding) -> f32 {
    let mut confidence = 0.0;
    if raw.project_type.is_some() {
        confidence += 0.3;
    }
    if !raw.materials.is_empty() {
        confidence += 0.2;
    }
    if !raw.dimensions.is_empty() {
        confidence += 0.3;
    }
    if !raw.conditions.is_empty() {
        confidence += 0.1;
    }
    if !raw.special_considerations.is_empty() {
        confidence += 0.1;
    }
    confidence
}

/// Load and normalize an image into an analyzer payload. URL sources pass
/// through untouched — fetching is the analyzer's concern.
pub(crate) async fn prepare_payload(
    image: &ProjectImage,
) -> Result<(ImagePayload, Vec<String>), AnalysisError> {
    match &image.source {
        ImageSource::Url(url) => Ok((ImagePayload::Url(url.clone()), Vec::new())),
        ImageSource::Bytes(bytes) => enhance(bytes),
        ImageSource::Path(path) => {
            let bytes = tokio::fs::read(path).await?;
            enhance(&bytes)
        }
    }
}

fn enhance(bytes: &[u8]) -> Result<(ImagePayload, Vec<String>), AnalysisError> {
    let enhanced = preprocess_image(bytes)?;
    Ok((
        ImagePayload::Bytes {
            data: enhanced.data,
            mime_type: enhanced.mime_type,
        },
        enhanced.warnings,
    ))
}
