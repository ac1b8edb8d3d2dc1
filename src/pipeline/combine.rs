//! Cross-source reconciliation. Pure and deterministic: no analyzer calls,
//! same inputs always produce the same aggregate.

use std::collections::HashMap;

use super::structuring::leading_number;
use super::types::{AggregatedFindings, ImageFinding, MergedFindings, NotesFindings};

/// Ratio under which two numeric dimension values count as agreeing.
const DIMENSION_AGREEMENT_RATIO: f64 = 0.2;

/// Merge per-image and notes findings into one aggregated view.
///
/// Project type is majority-voted across all sources. Dimension and
/// material keys are unioned, with notes taking precedence over images on
/// keys present in both — typed notes are usually more deliberate than
/// what a model reads off a photo.
pub fn combine_findings(
    from_images: &[ImageFinding],
    from_notes: &NotesFindings,
) -> AggregatedFindings {
    let project_type = vote_project_type(from_images, from_notes);

    // Dimensions: first-wins across images in order, then notes override.
    let mut dimensions: HashMap<String, String> = HashMap::new();
    for finding in from_images {
        for (key, value) in &finding.dimensions {
            dimensions
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    for (key, value) in &from_notes.dimensions {
        dimensions.insert(key.clone(), value.clone());
    }

    let mut materials: Vec<String> = Vec::new();
    for m in from_images
        .iter()
        .flat_map(|f| f.materials.iter())
        .chain(from_notes.materials.iter())
    {
        if !materials.iter().any(|seen| seen.eq_ignore_ascii_case(m)) {
            materials.push(m.clone());
        }
    }

    let mut conditions: Vec<String> = Vec::new();
    for c in from_images.iter().flat_map(|f| f.conditions.iter()) {
        if !conditions.iter().any(|seen| seen.eq_ignore_ascii_case(c)) {
            conditions.push(c.clone());
        }
    }

    let mut special: Vec<String> = Vec::new();
    for s in from_images
        .iter()
        .flat_map(|f| f.special_considerations.iter())
        .chain(from_notes.special_considerations.iter())
    {
        if !special.iter().any(|seen| seen.eq_ignore_ascii_case(s)) {
            special.push(s.clone());
        }
    }

    let coherence_score = coherence(from_images, from_notes);

    AggregatedFindings {
        from_images: from_images.to_vec(),
        from_notes: from_notes.clone(),
        merged: MergedFindings {
            project_type,
            dimensions,
            materials,
            conditions,
            special_considerations: special,
        },
        coherence_score,
    }
}

/// Majority vote across image findings plus the notes finding.
/// Ties break toward the notes-declared type, then first seen.
fn vote_project_type(
    from_images: &[ImageFinding],
    from_notes: &NotesFindings,
) -> Option<String> {
    let mut votes: Vec<(String, usize)> = Vec::new();
    let mut cast = |t: &str| {
        let key = t.trim().to_lowercase();
        if key.is_empty() {
            return;
        }
        match votes.iter_mut().find(|(seen, _)| *seen == key) {
            Some((_, n)) => *n += 1,
            None => votes.push((key, 1)),
        }
    };

    for finding in from_images {
        if let Some(t) = &finding.project_type {
            cast(t);
        }
    }
    if let Some(t) = &from_notes.project_type {
        cast(t);
    }

    let best = votes.iter().map(|(_, n)| *n).max()?;
    let notes_type = from_notes
        .project_type
        .as_ref()
        .map(|t| t.trim().to_lowercase());

    votes
        .iter()
        .filter(|(_, n)| *n == best)
        .map(|(t, _)| t.clone())
        .find(|t| Some(t) == notes_type.as_ref())
        .or_else(|| {
            votes
                .iter()
                .find(|(_, n)| *n == best)
                .map(|(t, _)| t.clone())
        })
}

/// Agreement between sources in [0, 1]:
/// 0.5 if the notes-declared type appears among image-declared types, plus
/// 0.5 weighted by the fraction of overlapping numeric dimension keys whose
/// values agree within a 20% ratio.
fn coherence(from_images: &[ImageFinding], from_notes: &NotesFindings) -> f32 {
    let mut score = 0.0f32;

    if let Some(notes_type) = &from_notes.project_type {
        let agrees = from_images.iter().any(|f| {
            f.project_type
                .as_ref()
                .is_some_and(|t| t.eq_ignore_ascii_case(notes_type))
        });
        if agrees {
            score += 0.5;
        }
    }

    // Image-side view of each dimension key: first numeric value wins.
    let mut image_dims: HashMap<String, f64> = HashMap::new();
    for finding in from_images {
        for (key, value) in &finding.dimensions {
            if let Some(n) = leading_number(value) {
                image_dims.entry(key.to_lowercase()).or_insert(n);
            }
        }
    }

    let mut overlapping = 0usize;
    let mut agreeing = 0usize;
    for (key, value) in &from_notes.dimensions {
        let Some(notes_n) = leading_number(value) else {
            continue;
        };
        let Some(&image_n) = image_dims.get(&key.to_lowercase()) else {
            continue;
        };
        overlapping += 1;
        let max = notes_n.abs().max(image_n.abs());
        if max == 0.0 || (notes_n - image_n).abs() / max < DIMENSION_AGREEMENT_RATIO {
            agreeing += 1;
        }
    }

    if overlapping > 0 {
        score += 0.5 * (agreeing as f32 / overlapping as f32);
    }

    score.clamp(0.0, 1.0)
}
