//! Optional deep-dive for project types where material availability moves
//! the quote: an extra vision pass plus a materials lookup, distilled into
//! a draft purchase order. Nothing here is allowed to fail the run — every
//! problem becomes a warning and the stage still counts as completed.

use std::sync::{Arc, Mutex};

use super::image_analysis::prepare_payload;
use super::ledger::RunLedger;
use super::parser::parse_finding_payload;
use super::prompt::{build_specialized_prompt, IMAGE_SYSTEM_PROMPT};
use super::structuring::StructuredCore;
use super::types::{
    ImageKind, MaterialAvailability, MaterialsLookup, ProjectImage, ProjectLocation,
    PurchaseOrderDraft, PurchaseOrderLine, VisionAnalyzer,
};

/// Project types that get the deep-dive treatment.
pub const SPECIALIZED_TRIGGERS: &[&str] = &["window_replacement", "door_replacement"];

/// Everything the deep-dive adds on top of the structured core.
#[derive(Debug, Clone, Default)]
pub struct SpecializedOutcome {
    pub material_availability: Option<MaterialAvailability>,
    pub purchase_order_draft: Option<PurchaseOrderDraft>,
    pub extra_elements: Vec<String>,
}

pub struct SpecializedAnalysisStage {
    vision: Arc<dyn VisionAnalyzer>,
    materials: Option<Arc<dyn MaterialsLookup>>,
}

impl SpecializedAnalysisStage {
    pub fn new(
        vision: Arc<dyn VisionAnalyzer>,
        materials: Option<Arc<dyn MaterialsLookup>>,
    ) -> Self {
        Self { vision, materials }
    }

    pub fn triggers_for(project_type: &str) -> bool {
        SPECIALIZED_TRIGGERS.contains(&project_type)
    }

    /// Run the deep-dive when the detected type calls for it.
    /// Returns `None` for non-triggering types; never errors.
    pub async fn run(
        &self,
        core: &StructuredCore,
        images: &[ProjectImage],
        location: &ProjectLocation,
        ledger: &Mutex<RunLedger>,
    ) -> Option<SpecializedOutcome> {
        if !Self::triggers_for(&core.project_type) {
            tracing::debug!(
                project_type = %core.project_type,
                "specialized analysis not applicable"
            );
            return None;
        }

        let mut outcome = SpecializedOutcome::default();

        // One focused vision pass over the best available photo. Site
        // photos show the actual units; fall back to whatever exists.
        let target = images
            .iter()
            .find(|i| i.kind == ImageKind::Site)
            .or_else(|| images.first());
        if let Some(image) = target {
            match self.deep_dive(image, &core.project_type).await {
                Ok(elements) => outcome.extra_elements = elements,
                Err(e) => {
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .warn(format!("specialized vision pass failed: {e}"));
                }
            }
        }

        if let Some(lookup) = &self.materials {
            let details = serde_json::json!({
                "projectType": core.project_type,
                "subtype": core.project_subtype,
                "dimensions": core.dimensions,
                "elements": outcome.extra_elements,
            });
            match lookup.find(&core.project_type, &details, location).await {
                Ok(availability) => {
                    outcome.purchase_order_draft =
                        Some(draft_purchase_order(core, &availability));
                    outcome.material_availability = Some(availability);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "materials lookup failed");
                    ledger
                        .lock()
                        .expect("ledger poisoned")
                        .warn(format!("materials lookup failed: {e}"));
                }
            }
        }

        Some(outcome)
    }

    async fn deep_dive(
        &self,
        image: &ProjectImage,
        project_type: &str,
    ) -> Result<Vec<String>, super::AnalysisError> {
        let (payload, _) = prepare_payload(image).await?;
        let prompt = build_specialized_prompt(project_type);
        let response = self
            .vision
            .analyze(&prompt, IMAGE_SYSTEM_PROMPT, &payload)
            .await?;

        let raw = parse_finding_payload(&response)?;
        let mut elements = raw.conditions;
        elements.extend(raw.special_considerations);
        elements.extend(raw.materials);
        Ok(elements)
    }
}

/// Turn the availability answer into a purchase-order draft. Quantity comes
/// from the unit count when the evidence produced one.
fn draft_purchase_order(
    core: &StructuredCore,
    availability: &MaterialAvailability,
) -> PurchaseOrderDraft {
    let quantity = core.dimensions.get("count").copied().unwrap_or(1.0);
    let items = availability
        .recommended_products
        .iter()
        .map(|p| PurchaseOrderLine {
            description: p.name.clone(),
            quantity,
            sku: p.sku.clone(),
        })
        .collect();

    PurchaseOrderDraft {
        items,
        notes: Some(format!(
            "Draft for {} — confirm quantities before ordering",
            core.project_type
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ollama::MockVisionAnalyzer;
    use crate::pipeline::types::Product;
    use crate::pipeline::{AnalysisError, ProviderErrorKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use uuid::Uuid;

    struct MockMaterials {
        fail: bool,
    }

    #[async_trait]
    impl MaterialsLookup for MockMaterials {
        async fn find(
            &self,
            _category: &str,
            _details: &serde_json::Value,
            _location: &ProjectLocation,
        ) -> Result<MaterialAvailability, AnalysisError> {
            if self.fail {
                return Err(AnalysisError::provider(
                    ProviderErrorKind::Connection,
                    "supplier API unreachable",
                ));
            }
            Ok(MaterialAvailability {
                availability: "in_stock".into(),
                recommended_products: vec![Product {
                    name: "Vinyl double-hung window 36x48".into(),
                    sku: Some("WIN-3648".into()),
                    unit_price: Some(279.0),
                }],
            })
        }
    }

    fn window_core(count: f64) -> StructuredCore {
        let mut dimensions = HashMap::new();
        dimensions.insert("count".to_string(), count);
        StructuredCore {
            project_type: "window_replacement".to_string(),
            dimensions,
            ..Default::default()
        }
    }

    fn site_image() -> ProjectImage {
        ProjectImage {
            id: "img-1".into(),
            source: crate::pipeline::types::ImageSource::Url(
                "https://cdn.example.com/windows.jpg".into(),
            ),
            kind: ImageKind::Site,
            mime_type: "image/jpeg".into(),
        }
    }

    fn test_ledger() -> Mutex<RunLedger> {
        Mutex::new(RunLedger::new(Uuid::new_v4()))
    }

    const DEEP_DIVE_RESPONSE: &str =
        r#"{"conditions": ["6 windows visible"], "materials": ["vinyl"]}"#;

    #[tokio::test]
    async fn non_trigger_type_is_skipped() {
        let stage = SpecializedAnalysisStage::new(
            Arc::new(MockVisionAnalyzer::new(DEEP_DIVE_RESPONSE)),
            Some(Arc::new(MockMaterials { fail: false })),
        );
        let ledger = test_ledger();
        let mut core = window_core(1.0);
        core.project_type = "fencing".to_string();

        let outcome = stage
            .run(&core, &[site_image()], &ProjectLocation::default(), &ledger)
            .await;

        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn window_replacement_gets_full_deep_dive() {
        let stage = SpecializedAnalysisStage::new(
            Arc::new(MockVisionAnalyzer::new(DEEP_DIVE_RESPONSE)),
            Some(Arc::new(MockMaterials { fail: false })),
        );
        let ledger = test_ledger();

        let outcome = stage
            .run(
                &window_core(6.0),
                &[site_image()],
                &ProjectLocation::default(),
                &ledger,
            )
            .await
            .unwrap();

        assert!(outcome.extra_elements.contains(&"6 windows visible".to_string()));
        let availability = outcome.material_availability.unwrap();
        assert_eq!(availability.availability, "in_stock");

        let draft = outcome.purchase_order_draft.unwrap();
        assert_eq!(draft.items.len(), 1);
        assert_eq!(draft.items[0].quantity, 6.0);
        assert_eq!(draft.items[0].sku.as_deref(), Some("WIN-3648"));
    }

    #[tokio::test]
    async fn materials_failure_is_a_warning_not_an_error() {
        let stage = SpecializedAnalysisStage::new(
            Arc::new(MockVisionAnalyzer::new(DEEP_DIVE_RESPONSE)),
            Some(Arc::new(MockMaterials { fail: true })),
        );
        let ledger = test_ledger();

        let outcome = stage
            .run(
                &window_core(2.0),
                &[site_image()],
                &ProjectLocation::default(),
                &ledger,
            )
            .await
            .unwrap();

        assert!(outcome.material_availability.is_none());
        assert!(outcome.purchase_order_draft.is_none());
        assert!(ledger
            .lock()
            .unwrap()
            .warnings
            .iter()
            .any(|w| w.contains("materials lookup failed")));
    }

    #[tokio::test]
    async fn vision_failure_is_a_warning_and_lookup_still_runs() {
        let stage = SpecializedAnalysisStage::new(
            Arc::new(MockVisionAnalyzer::failing(ProviderErrorKind::Timeout)),
            Some(Arc::new(MockMaterials { fail: false })),
        );
        let ledger = test_ledger();

        let outcome = stage
            .run(
                &window_core(1.0),
                &[site_image()],
                &ProjectLocation::default(),
                &ledger,
            )
            .await
            .unwrap();

        assert!(outcome.extra_elements.is_empty());
        assert!(outcome.material_availability.is_some());
        assert!(ledger
            .lock()
            .unwrap()
            .warnings
            .iter()
            .any(|w| w.contains("specialized vision pass failed")));
    }

    #[tokio::test]
    async fn no_materials_collaborator_still_produces_outcome() {
        let stage = SpecializedAnalysisStage::new(
            Arc::new(MockVisionAnalyzer::new(DEEP_DIVE_RESPONSE)),
            None,
        );
        let ledger = test_ledger();

        let outcome = stage
            .run(
                &window_core(1.0),
                &[site_image()],
                &ProjectLocation::default(),
                &ledger,
            )
            .await
            .unwrap();

        assert!(outcome.material_availability.is_none());
        assert!(!outcome.extra_elements.is_empty());
    }

    #[test]
    fn trigger_list_matches_documented_types() {
        assert!(SpecializedAnalysisStage::triggers_for("window_replacement"));
        assert!(SpecializedAnalysisStage::triggers_for("door_replacement"));
        assert!(!SpecializedAnalysisStage::triggers_for("fencing"));
        assert!(!SpecializedAnalysisStage::triggers_for("unknown"));
    }
}
