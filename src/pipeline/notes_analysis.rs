//! Free-text notes analysis with a layered degradation chain:
//! primary analyzer (retried) → secondary analyzer (one shot) →
//! deterministic keyword extraction. Only a fallback-mode run with both
//! analyzers down propagates an error.

use std::sync::{Arc, Mutex};

use super::fallback::keyword_notes_findings;
use super::image_analysis::field_completeness_confidence;
use super::ledger::{RunLedger, StageName};
use super::parser::{parse_finding_payload, recover_partial};
use super::prompt::{build_notes_prompt, NOTES_SYSTEM_PROMPT};
use super::retry::{run_with_retry, RetryPolicy};
use super::types::{NotesFindings, NotesSource, TextAnalyzer};
use super::AnalysisError;
use crate::config::PipelineConfig;

pub struct NotesAnalysisStage {
    primary: Arc<dyn TextAnalyzer>,
    secondary: Option<Arc<dyn TextAnalyzer>>,
    policy: RetryPolicy,
}

impl NotesAnalysisStage {
    pub fn new(
        primary: Arc<dyn TextAnalyzer>,
        secondary: Option<Arc<dyn TextAnalyzer>>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            policy: config.retry_policy(),
        }
    }

    /// Analyze the notes. Always produces findings, except in fallback mode
    /// when every analyzer call has errored — then the last provider error
    /// propagates to the orchestrator.
    pub async fn run(
        &self,
        notes: &str,
        fallback_mode: bool,
        ledger: &Mutex<RunLedger>,
    ) -> Result<NotesFindings, AnalysisError> {
        if notes.trim().is_empty() {
            return Ok(NotesFindings {
                is_empty: true,
                source: NotesSource::Empty,
                ..Default::default()
            });
        }

        let prompt = build_notes_prompt(notes);
        let mut last_provider_error: Option<AnalysisError> = None;

        match run_with_retry(StageName::NotesAnalysis, &self.policy, ledger, || {
            self.primary.complete(&prompt, NOTES_SYSTEM_PROMPT)
        })
        .await
        {
            Ok(response) => {
                if let Some(findings) =
                    findings_from_response(&response, NotesSource::Primary, ledger)
                {
                    return Ok(findings);
                }
                ledger
                    .lock()
                    .expect("ledger poisoned")
                    .warn("primary notes analyzer returned unusable text");
            }
            Err(e) => {
                tracing::warn!(error = %e, "primary notes analyzer failed");
                last_provider_error = Some(e);
            }
        }

        // Different provider, single shot — if it is also struggling there
        // is no point burning its quota on retries.
        if let Some(secondary) = &self.secondary {
            match secondary.complete(&prompt, NOTES_SYSTEM_PROMPT).await {
                Ok(response) => {
                    if let Some(findings) =
                        findings_from_response(&response, NotesSource::Secondary, ledger)
                    {
                        ledger
                            .lock()
                            .expect("ledger poisoned")
                            .warn("notes analysis used the secondary analyzer");
                        return Ok(findings);
                    }
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .warn("secondary notes analyzer returned unusable text");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "secondary notes analyzer failed");
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .errors
                        .push(format!("notes: secondary analyzer: {e}"));
                    last_provider_error = Some(e);
                }
            }
        }

        if fallback_mode {
            if let Some(e) = last_provider_error {
                return Err(e);
            }
        }

        ledger
            .lock()
            .expect("ledger poisoned")
            .warn("notes analysis degraded to keyword extraction");
        Ok(keyword_notes_findings(notes))
    }
}

/// Parse an analyzer response into findings; `None` when the text carries
/// no usable signal so the caller can move down the degradation chain.
fn findings_from_response(
    response: &str,
    source: NotesSource,
    ledger: &Mutex<RunLedger>,
) -> Option<NotesFindings> {
    let raw = match parse_finding_payload(response) {
        Ok(raw) => raw,
        Err(e) => {
            let partial = recover_partial(response);
            if !partial.has_signal() {
                return None;
            }
            ledger.lock().expect("ledger poisoned").warn(format!(
                "notes: analyzer response not parseable ({e}), recovered partially"
            ));
            partial
        }
    };

    if !raw.has_signal() {
        return None;
    }

    let confidence = field_completeness_confidence(&raw);
    Some(NotesFindings {
        is_empty: false,
        project_type: raw.project_type,
        dimensions: raw.dimensions,
        materials: raw.materials,
        demolition_needed: raw.demolition_needed.unwrap_or(false),
        special_considerations: raw.special_considerations,
        source,
        confidence,
    })
}
