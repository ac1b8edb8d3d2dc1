use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ledger::StageName;
use super::AnalysisError;

/// Where an image's bytes come from. The pipeline never mutates the
/// original source; preprocessing produces enhanced copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Path(PathBuf),
    Url(String),
    Bytes(Vec<u8>),
}

/// What the contractor declared the photo to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Photo of the actual job site (existing conditions).
    Site,
    /// Inspiration or catalog photo of the desired outcome.
    Reference,
    /// Hand-drawn or CAD sketch with dimensions.
    Sketch,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Site => "site",
            ImageKind::Reference => "reference",
            ImageKind::Sketch => "sketch",
        }
    }
}

/// One contractor-supplied project image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectImage {
    pub id: String,
    pub source: ImageSource,
    pub kind: ImageKind,
    pub mime_type: String,
}

impl ProjectImage {
    /// Best-effort filename for heuristic guessing; empty for inline bytes.
    pub fn file_name(&self) -> String {
        match &self.source {
            ImageSource::Path(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ImageSource::Url(u) => u.rsplit('/').next().unwrap_or("").to_string(),
            ImageSource::Bytes(_) => String::new(),
        }
    }
}

/// Job location, used for materials availability and cache keying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectLocation {
    pub zip: String,
    pub state: String,
    pub city: String,
}

/// Per-run options. `fallback_mode` and `resume_from` are normally set only
/// by the orchestrator's own fallback pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisOptions {
    pub processing_id: Option<Uuid>,
    pub resume_from: Option<StageName>,
    pub force_reprocess: bool,
    pub fallback_mode: bool,
}

/// One complete analysis request. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub images: Vec<ProjectImage>,
    pub notes: String,
    #[serde(default)]
    pub location: ProjectLocation,
    #[serde(default)]
    pub options: AnalysisOptions,
}

/// Image data handed to a vision analyzer.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    Bytes { data: Vec<u8>, mime_type: String },
    Url(String),
}

/// Findings extracted from a single image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageFinding {
    pub image_id: String,
    pub project_type: Option<String>,
    pub dimensions: HashMap<String, String>,
    pub materials: Vec<String>,
    pub conditions: Vec<String>,
    pub special_considerations: Vec<String>,
    pub confidence: f32,
    pub inferred_from_filename: bool,
    pub error: Option<String>,
}

/// How the notes findings were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotesSource {
    #[default]
    Empty,
    Primary,
    Secondary,
    KeywordFallback,
}

/// Findings extracted from the free-text notes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotesFindings {
    pub is_empty: bool,
    pub project_type: Option<String>,
    pub dimensions: HashMap<String, String>,
    pub materials: Vec<String>,
    pub demolition_needed: bool,
    pub special_considerations: Vec<String>,
    pub source: NotesSource,
    pub confidence: f32,
}

/// The merged, pre-structuring view of all evidence sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedFindings {
    pub project_type: Option<String>,
    pub dimensions: HashMap<String, String>,
    pub materials: Vec<String>,
    pub conditions: Vec<String>,
    pub special_considerations: Vec<String>,
}

/// Output of the combination stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedFindings {
    pub from_images: Vec<ImageFinding>,
    pub from_notes: NotesFindings,
    pub merged: MergedFindings,
    /// Agreement between image-derived and notes-derived findings.
    pub coherence_score: f32,
}

/// Availability answer from the materials collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialAvailability {
    pub availability: String,
    pub recommended_products: Vec<Product>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub sku: Option<String>,
    pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurchaseOrderDraft {
    pub items: Vec<PurchaseOrderLine>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseOrderLine {
    pub description: String,
    pub quantity: f64,
    pub sku: Option<String>,
}

/// Run bookkeeping attached to every result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMeta {
    pub processing_id: Uuid,
    pub completed_stages: Vec<StageName>,
    pub processing_ms: u64,
    /// Overall trust score, always in [0, 1].
    pub confidence_score: f32,
    pub cache_hit: bool,
    pub warnings: Vec<String>,
}

/// The structured project specification consumed by the pricing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub project_type: String,
    pub project_subtype: Option<String>,
    pub dimensions: HashMap<String, f64>,
    pub options: HashMap<String, serde_json::Value>,
    pub detected_elements: Vec<String>,
    pub material_availability: Option<MaterialAvailability>,
    pub recommended_products: Vec<Product>,
    pub purchase_order_draft: Option<PurchaseOrderDraft>,
    pub generated_with_fallback: bool,
    pub meta: ProcessingMeta,
}

/// Vision-capable analyzer abstraction (allows mocking).
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        prompt: &str,
        system: &str,
        image: &ImagePayload,
    ) -> Result<String, AnalysisError>;
}

/// Plain-text analyzer abstraction. At least two independent
/// implementations are expected so one can back the other up.
#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    async fn complete(&self, prompt: &str, system: &str) -> Result<String, AnalysisError>;
}

/// Materials-availability collaborator for the specialized deep-dive.
#[async_trait]
pub trait MaterialsLookup: Send + Sync {
    async fn find(
        &self,
        category: &str,
        details: &serde_json::Value,
        location: &ProjectLocation,
    ) -> Result<MaterialAvailability, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_from_path_source() {
        let img = ProjectImage {
            id: "img-1".into(),
            source: ImageSource::Path(PathBuf::from("/uploads/backyard_fence.jpg")),
            kind: ImageKind::Site,
            mime_type: "image/jpeg".into(),
        };
        assert_eq!(img.file_name(), "backyard_fence.jpg");
    }

    #[test]
    fn file_name_from_url_source() {
        let img = ProjectImage {
            id: "img-2".into(),
            source: ImageSource::Url("https://cdn.example.com/jobs/deck_photo.png".into()),
            kind: ImageKind::Reference,
            mime_type: "image/png".into(),
        };
        assert_eq!(img.file_name(), "deck_photo.png");
    }

    #[test]
    fn file_name_empty_for_inline_bytes() {
        let img = ProjectImage {
            id: "img-3".into(),
            source: ImageSource::Bytes(vec![1, 2, 3]),
            kind: ImageKind::Sketch,
            mime_type: "image/png".into(),
        };
        assert!(img.file_name().is_empty());
    }

    #[test]
    fn request_roundtrips_through_json() {
        let request = AnalysisRequest {
            images: vec![ProjectImage {
                id: "a".into(),
                source: ImageSource::Url("https://example.com/a.jpg".into()),
                kind: ImageKind::Site,
                mime_type: "image/jpeg".into(),
            }],
            notes: "70 linear feet wood privacy fence".into(),
            location: ProjectLocation {
                zip: "94509".into(),
                state: "CA".into(),
                city: "Antioch".into(),
            },
            options: AnalysisOptions::default(),
        };

        let json = serde_json::to_string(&request).unwrap();
        let back: AnalysisRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.images[0].id, "a");
        assert_eq!(back.location.zip, "94509");
        assert!(!back.options.fallback_mode);
    }
}
