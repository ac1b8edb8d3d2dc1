//! Deterministic extraction used when the analyzers are unavailable or
//! return garbage. Keyword tables cover English and Spanish, the two
//! languages contractor notes actually arrive in.

use std::collections::HashMap;

use regex::Regex;

use super::types::{ImageFinding, NotesFindings, NotesSource, ProjectImage};

/// Confidence assigned to a filename-only guess.
pub const FILENAME_GUESS_CONFIDENCE: f32 = 0.1;

/// (canonical type, English keywords, Spanish keywords)
const PROJECT_TYPE_KEYWORDS: &[(&str, &[&str], &[&str])] = &[
    (
        "fencing",
        &["fence", "fencing", "picket", "privacy fence", "chain link"],
        &["cerca", "cerco", "valla", "reja"],
    ),
    (
        "deck",
        &["deck", "decking", "porch"],
        &["terraza", "plataforma"],
    ),
    (
        "roofing",
        &["roof", "roofing", "shingle", "shingles", "reroof"],
        &["techo", "tejado", "teja"],
    ),
    (
        "window_replacement",
        &["window", "windows", "glazing"],
        &["ventana", "ventanas"],
    ),
    (
        "door_replacement",
        &["door", "doors", "entry door"],
        &["puerta", "puertas"],
    ),
    (
        "concrete",
        &["concrete", "driveway", "slab", "sidewalk"],
        &["concreto", "losa", "banqueta"],
    ),
    (
        "painting",
        &["paint", "painting", "repaint"],
        &["pintura", "pintar"],
    ),
    (
        "kitchen_remodel",
        &["kitchen", "cabinets", "countertop"],
        &["cocina", "gabinetes"],
    ),
    (
        "bathroom_remodel",
        &["bathroom", "shower", "vanity"],
        &["baño", "ducha"],
    ),
    (
        "flooring",
        &["flooring", "hardwood floor", "laminate", "tile floor"],
        &["piso", "pisos"],
    ),
];

/// (canonical material, keywords in both languages)
const MATERIAL_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "wood",
        &["wood", "wooden", "cedar", "pine", "redwood", "lumber", "madera"],
    ),
    ("vinyl", &["vinyl", "pvc", "vinilo"]),
    (
        "metal",
        &["metal", "steel", "aluminum", "iron", "acero", "aluminio", "hierro"],
    ),
    ("composite", &["composite", "trex", "compuesto"]),
    ("concrete", &["concrete", "cement", "concreto", "cemento"]),
    ("asphalt", &["asphalt", "asfalto"]),
    ("tile", &["tile", "ceramic", "azulejo", "ceramica", "cerámica"]),
];

const DEMOLITION_KEYWORDS: &[&str] = &[
    "demolish",
    "demolition",
    "demo",
    "tear down",
    "tear out",
    "remove existing",
    "rip out",
    "demoler",
    "demolición",
    "quitar",
    "retirar",
];

/// Word-boundary keyword test; multi-word phrases match as substrings.
fn contains_keyword(text: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        return text.contains(keyword);
    }
    Regex::new(&format!(r"\b{}\b", regex::escape(keyword)))
        .expect("keyword regex is valid")
        .is_match(text)
}

/// Detect the most likely project type from free text. The type with the
/// most keyword hits wins; ties go to the earlier table entry.
pub fn detect_project_type(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let mut best: Option<(&str, usize)> = None;

    for (canonical, english, spanish) in PROJECT_TYPE_KEYWORDS {
        let hits = english
            .iter()
            .chain(spanish.iter())
            .filter(|kw| contains_keyword(&lower, kw))
            .count();
        if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
            best = Some((canonical, hits));
        }
    }

    best.map(|(t, _)| t.to_string())
}

/// Pull numeric dimensions out of free text: explicit labels, "N x M"
/// pairs, square footage, linear footage, and heights ("6 feet tall").
pub fn extract_dimensions(text: &str) -> HashMap<String, String> {
    let mut dims = HashMap::new();

    // Height phrased with a unit suffix: "6 feet tall", "8 ft high".
    let height_re = Regex::new(
        r"(?i)(\d+(?:\.\d+)?)\s*(?:feet|foot|ft|pies|')?\s*(?:tall|high|alto|de altura)",
    )
    .expect("height regex is valid");
    let mut height_span = None;
    if let Some(cap) = height_re.captures(text) {
        dims.insert("height".to_string(), cap[1].to_string());
        height_span = cap.get(0).map(|m| m.range());
    }

    // Explicit labels: "height: 6", "largo: 20".
    let labeled_re =
        Regex::new(r"(?i)\b(length|width|height|depth|area|count|largo|ancho|altura|area)\s*[:=]\s*(\d+(?:\.\d+)?)")
            .expect("label regex is valid");
    for cap in labeled_re.captures_iter(text) {
        let key = match cap[1].to_lowercase().as_str() {
            "largo" => "length".to_string(),
            "ancho" => "width".to_string(),
            "altura" => "height".to_string(),
            other => other.to_string(),
        };
        dims.entry(key).or_insert_with(|| cap[2].to_string());
    }

    // Square footage: "1500 sq ft", "200 square feet".
    let area_re = Regex::new(
        r"(?i)(\d+(?:\.\d+)?)\s*(?:sq\.?\s?ft|sqft|square\s+feet|pies\s+cuadrados|m2|metros\s+cuadrados)",
    )
    .expect("area regex is valid");
    if let Some(cap) = area_re.captures(text) {
        dims.entry("area".to_string())
            .or_insert_with(|| cap[1].to_string());
    }

    // Dimension pairs: "10 x 12", "10 by 12".
    let pair_re = Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:x|by|por)\s*(\d+(?:\.\d+)?)")
        .expect("pair regex is valid");
    if let Some(cap) = pair_re.captures(text) {
        dims.entry("length".to_string())
            .or_insert_with(|| cap[1].to_string());
        dims.entry("width".to_string())
            .or_insert_with(|| cap[2].to_string());
    }

    // Linear footage: "70 linear feet", "70 ft". Skip the height match.
    let length_re =
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:linear\s+|lineal(?:es)?\s+)?(?:feet|foot|ft|pies)\b")
            .expect("length regex is valid");
    for cap in length_re.captures_iter(text) {
        let span = cap.get(0).map(|m| m.range());
        let overlaps_height = match (&span, &height_span) {
            (Some(a), Some(b)) => a.start < b.end && b.start < a.end,
            _ => false,
        };
        if overlaps_height {
            continue;
        }
        dims.entry("length".to_string())
            .or_insert_with(|| cap[1].to_string());
    }

    dims
}

/// Detect known materials mentioned in free text.
pub fn extract_materials(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    MATERIAL_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| contains_keyword(&lower, kw)))
        .map(|(canonical, _)| canonical.to_string())
        .collect()
}

/// Whether the text asks for demolition or removal of existing work.
pub fn detect_demolition(text: &str) -> bool {
    let lower = text.to_lowercase();
    DEMOLITION_KEYWORDS
        .iter()
        .any(|kw| contains_keyword(&lower, kw))
}

/// Keyword-only notes extraction — the last resort when both analyzers are
/// out. Deterministic, low confidence, never fails.
pub fn keyword_notes_findings(notes: &str) -> NotesFindings {
    let project_type = detect_project_type(notes);
    let dimensions = extract_dimensions(notes);
    let materials = extract_materials(notes);
    let demolition_needed = detect_demolition(notes);

    let mut confidence = 0.0;
    if project_type.is_some() {
        confidence += 0.15;
    }
    if !dimensions.is_empty() {
        confidence += 0.15;
    }
    if !materials.is_empty() {
        confidence += 0.15;
    }

    NotesFindings {
        is_empty: false,
        project_type,
        dimensions,
        materials,
        demolition_needed,
        special_considerations: Vec::new(),
        source: NotesSource::KeywordFallback,
        confidence,
    }
}

/// Guess a finding from the image's filename alone. Used when the vision
/// analyzer is unreachable and the run is not already in fallback mode.
pub fn guess_from_filename(image: &ProjectImage) -> ImageFinding {
    let name = image
        .file_name()
        .to_lowercase()
        .replace(['_', '-', '.'], " ");
    let project_type = detect_project_type(&name);
    let confidence = if project_type.is_some() {
        FILENAME_GUESS_CONFIDENCE
    } else {
        0.0
    };

    ImageFinding {
        image_id: image.id.clone(),
        project_type,
        confidence,
        inferred_from_filename: true,
        ..Default::default()
    }
}
