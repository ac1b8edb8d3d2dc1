//! Projection of aggregated findings into the canonical project shape the
//! pricing engine consumes: normalized type, numeric dimensions, and
//! per-type minimum-viable defaults when the evidence came up short.

use std::collections::HashMap;

use regex::Regex;

use super::types::AggregatedFindings;
use super::AnalysisError;

/// Project types the pricing engine has rate tables for.
pub const KNOWN_PROJECT_TYPES: &[&str] = &[
    "fencing",
    "deck",
    "roofing",
    "window_replacement",
    "door_replacement",
    "concrete",
    "painting",
    "kitchen_remodel",
    "bathroom_remodel",
    "flooring",
];

/// Minimum-viable dimensions per recognized type. Filled in only for keys
/// the evidence did not supply; the pricing engine cannot quote without them.
const MINIMUM_DIMENSIONS: &[(&str, &[(&str, f64)])] = &[
    ("fencing", &[("length", 100.0), ("height", 6.0)]),
    ("deck", &[("length", 12.0), ("width", 12.0)]),
    ("roofing", &[("area", 1500.0)]),
    ("concrete", &[("area", 200.0)]),
    ("painting", &[("area", 400.0)]),
    ("window_replacement", &[("count", 1.0)]),
    ("door_replacement", &[("count", 1.0)]),
];

/// Core structured output, before the specialized stage and confidence
/// scoring fill out the final spec.
#[derive(Debug, Clone, Default)]
pub struct StructuredCore {
    pub project_type: String,
    pub project_subtype: Option<String>,
    pub dimensions: HashMap<String, f64>,
    pub detected_elements: Vec<String>,
    pub demolition_needed: bool,
    pub warnings: Vec<String>,
}

impl StructuredCore {
    /// The degraded shape substituted when structuring fails outside
    /// fallback mode.
    pub fn minimal() -> Self {
        Self {
            project_type: "unknown".to_string(),
            ..Default::default()
        }
    }

    pub fn has_known_type(&self) -> bool {
        KNOWN_PROJECT_TYPES.contains(&self.project_type.as_str())
    }
}

/// Map analyzer-reported type strings onto canonical labels.
/// Accepts English and Spanish synonyms; unrecognized input is cleaned
/// (lowercased, underscored) but kept, so novel types still flow through.
pub fn normalize_project_type(raw: &str) -> String {
    let cleaned = raw.trim().to_lowercase().replace(['-', ' '], "_");
    if cleaned.is_empty() {
        return "unknown".to_string();
    }

    match cleaned.as_str() {
        "fence" | "fencing" | "privacy_fence" | "cerca" | "valla" => "fencing",
        "deck" | "decking" | "porch" | "terraza" => "deck",
        "roof" | "roofing" | "reroof" | "techo" | "tejado" => "roofing",
        "window" | "windows" | "window_replacement" | "ventanas" => "window_replacement",
        "door" | "doors" | "door_replacement" | "puertas" => "door_replacement",
        "concrete" | "driveway" | "slab" | "concreto" => "concrete",
        "paint" | "painting" | "repaint" | "pintura" => "painting",
        "kitchen" | "kitchen_remodel" | "cocina" => "kitchen_remodel",
        "bathroom" | "bathroom_remodel" | "baño" | "bano" => "bathroom_remodel",
        "floor" | "floors" | "flooring" | "pisos" => "flooring",
        other => other,
    }
    .to_string()
}

/// Extract the leading numeric token from a dimension value like
/// "70 ft" or "approx. 6".
pub fn leading_number(value: &str) -> Option<f64> {
    let re = Regex::new(r"-?\d+(?:\.\d+)?").expect("number regex is valid");
    re.find(value)?.as_str().parse().ok()
}

/// Project the aggregate into the canonical core shape.
/// Fails only when the aggregate carries no usable signal at all; the
/// orchestrator decides whether that failure is fatal.
pub fn structure_findings(aggregated: &AggregatedFindings) -> Result<StructuredCore, AnalysisError> {
    let merged = &aggregated.merged;

    let no_signal = merged.project_type.is_none()
        && merged.dimensions.is_empty()
        && merged.materials.is_empty();
    if no_signal {
        return Err(AnalysisError::Parse(
            "aggregated findings carry no usable signal".into(),
        ));
    }

    let project_type = merged
        .project_type
        .as_deref()
        .map(normalize_project_type)
        .unwrap_or_else(|| "unknown".to_string());

    let mut warnings = Vec::new();
    let mut dimensions: HashMap<String, f64> = HashMap::new();
    for (key, value) in &merged.dimensions {
        match leading_number(value) {
            Some(n) if n.is_finite() && n > 0.0 => {
                dimensions.insert(key.to_lowercase(), n);
            }
            _ => warnings.push(format!("dropped non-numeric dimension {key}={value}")),
        }
    }

    if let Some((_, defaults)) = MINIMUM_DIMENSIONS
        .iter()
        .find(|(t, _)| *t == project_type)
    {
        for (key, default) in *defaults {
            if !dimensions.contains_key(*key) {
                dimensions.insert(key.to_string(), *default);
                warnings.push(format!(
                    "assumed default {key}={default} for {project_type}"
                ));
            }
        }
    }

    // Materials double as the subtype signal: a wood fence and a chain-link
    // fence price completely differently.
    let project_subtype = merged.materials.first().map(|m| m.to_lowercase());

    let mut detected_elements: Vec<String> = Vec::new();
    for e in merged
        .conditions
        .iter()
        .chain(merged.special_considerations.iter())
    {
        if !detected_elements
            .iter()
            .any(|seen| seen.eq_ignore_ascii_case(e))
        {
            detected_elements.push(e.clone());
        }
    }

    Ok(StructuredCore {
        project_type,
        project_subtype,
        dimensions,
        detected_elements,
        demolition_needed: aggregated.from_notes.demolition_needed,
        warnings,
    })
}
