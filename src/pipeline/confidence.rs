use super::structuring::StructuredCore;

/// Confidence thresholds for downstream consumers of the spec.
pub mod thresholds {
    /// Below this: the spec is mostly guesswork. Require human review.
    pub const LOW: f32 = 0.40;

    /// Below this: usable for a rough estimate, flag key fields.
    pub const MODERATE: f32 = 0.60;

    /// Above this: high confidence, safe for automated quoting.
    pub const HIGH: f32 = 0.80;
}

/// Cap on the data-quality contribution; stage completion and coherence
/// carry the rest of the weight.
const DATA_QUALITY_CAP: f32 = 0.3;

/// Compute the overall trust score for a run:
/// stage completion (weight 0.5) + data quality (capped) + coherence
/// between evidence sources (weight 0.2). Always in [0, 1].
pub fn compute_confidence(
    completed_stages: usize,
    total_stages: usize,
    core: &StructuredCore,
    has_materials: bool,
    coherence: f32,
) -> f32 {
    let stages_score = if total_stages == 0 {
        0.0
    } else {
        completed_stages as f32 / total_stages as f32
    };

    let mut data_quality: f32 = 0.0;
    if core.has_known_type() {
        data_quality += 0.2;
    }
    if !core.dimensions.is_empty() {
        data_quality += 0.15;
    }
    if has_materials {
        data_quality += 0.15;
    }
    data_quality = data_quality.min(DATA_QUALITY_CAP);

    (stages_score * 0.5 + data_quality + coherence * 0.2).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rich_core() -> StructuredCore {
        let mut dimensions = HashMap::new();
        dimensions.insert("length".to_string(), 70.0);
        StructuredCore {
            project_type: "fencing".to_string(),
            dimensions,
            ..Default::default()
        }
    }

    #[test]
    fn full_run_with_rich_data_scores_high() {
        let score = compute_confidence(6, 6, &rich_core(), true, 1.0);
        assert!(score > thresholds::HIGH, "expected > 0.8, got {score}");
        assert!(score <= 1.0);
    }

    #[test]
    fn empty_run_scores_zero() {
        let score = compute_confidence(0, 6, &StructuredCore::minimal(), false, 0.0);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn data_quality_is_capped() {
        // All three data signals present: 0.2 + 0.15 + 0.15 = 0.5, capped at 0.3.
        let with_all = compute_confidence(0, 6, &rich_core(), true, 0.0);
        assert!((with_all - DATA_QUALITY_CAP).abs() < f32::EPSILON);
    }

    #[test]
    fn unknown_type_lowers_score() {
        let mut unknown = rich_core();
        unknown.project_type = "unknown".to_string();
        let known = compute_confidence(6, 6, &rich_core(), true, 0.5);
        let not_known = compute_confidence(6, 6, &unknown, true, 0.5);
        assert!(known > not_known);
    }

    #[test]
    fn incomplete_stages_lower_score() {
        let full = compute_confidence(6, 6, &rich_core(), true, 0.5);
        let partial = compute_confidence(3, 6, &rich_core(), true, 0.5);
        assert!(full > partial);
    }

    #[test]
    fn score_is_always_in_unit_interval() {
        for completed in 0..=6 {
            for coherence in [0.0f32, 0.3, 0.7, 1.0] {
                for has_materials in [false, true] {
                    let score = compute_confidence(
                        completed,
                        6,
                        &rich_core(),
                        has_materials,
                        coherence,
                    );
                    assert!((0.0..=1.0).contains(&score), "out of range: {score}");
                }
            }
        }
    }

    #[test]
    fn zero_total_stages_does_not_divide_by_zero() {
        let score = compute_confidence(0, 0, &StructuredCore::minimal(), false, 0.0);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn threshold_constants_are_ordered() {
        assert!(thresholds::LOW < thresholds::MODERATE);
        assert!(thresholds::MODERATE < thresholds::HIGH);
    }
}
