//! Prompt construction for the vision and text analyzers.
//!
//! Every prompt demands a single JSON object so the parser has a fighting
//! chance; analyzers still wrap responses in prose often enough that the
//! parser must not rely on it.

use super::types::ImageKind;

/// Shared JSON contract for all extraction prompts.
const FINDINGS_SCHEMA: &str = r#"{
  "projectType": "short snake_case label, e.g. fencing, deck, roofing, window_replacement",
  "dimensions": {"length": "70 ft", "height": "6 ft"},
  "materials": ["wood", "concrete"],
  "conditions": ["sloped yard", "old fence present"],
  "specialConsiderations": ["gate needed"]
}"#;

pub const IMAGE_SYSTEM_PROMPT: &str = "You are a construction project intake assistant. \
You inspect contractor photos and report what the project involves. \
Respond with a single JSON object and nothing else.";

pub const NOTES_SYSTEM_PROMPT: &str = "You are a construction project intake assistant. \
You read contractor field notes, in English or Spanish, and extract the project scope. \
Respond with a single JSON object and nothing else.";

/// Build the per-image prompt, adapted to what the photo claims to show.
pub fn build_image_prompt(kind: ImageKind) -> String {
    let focus = match kind {
        ImageKind::Site => {
            "This is a photo of the actual job site. Describe the existing conditions, \
             what is being replaced or built, visible measurements, and site constraints."
        }
        ImageKind::Reference => {
            "This is a reference photo of the desired outcome, not the job site. \
             Describe the style, materials, and construction details the customer wants."
        }
        ImageKind::Sketch => {
            "This is a sketch or plan drawing. Read every labeled dimension and \
             annotation literally; they are the most reliable numbers available."
        }
    };

    format!(
        "{focus}\n\nReturn exactly this JSON shape (omit keys you cannot determine):\n{FINDINGS_SCHEMA}"
    )
}

/// Build the notes-extraction prompt.
pub fn build_notes_prompt(notes: &str) -> String {
    format!(
        "Extract the project scope from these contractor notes.\n\
         Notes:\n---\n{notes}\n---\n\n\
         Return exactly this JSON shape (omit keys you cannot determine), plus a boolean \
         \"demolitionNeeded\" key when the notes mention removing or tearing down existing work:\n\
         {FINDINGS_SCHEMA}"
    )
}

/// Build the specialized deep-dive prompt for a detected project type.
pub fn build_specialized_prompt(project_type: &str) -> String {
    format!(
        "Focus on the {project_type} work in this photo. Count the units involved, \
         note frame materials, sizes, and anything affecting installation difficulty.\n\n\
         Return exactly this JSON shape (omit keys you cannot determine):\n{FINDINGS_SCHEMA}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_prompt_varies_by_kind() {
        let site = build_image_prompt(ImageKind::Site);
        let sketch = build_image_prompt(ImageKind::Sketch);
        assert!(site.contains("job site"));
        assert!(sketch.contains("dimension"));
        assert_ne!(site, sketch);
    }

    #[test]
    fn prompts_carry_the_json_contract() {
        for prompt in [
            build_image_prompt(ImageKind::Reference),
            build_notes_prompt("fix the fence"),
            build_specialized_prompt("window_replacement"),
        ] {
            assert!(prompt.contains("projectType"));
            assert!(prompt.contains("dimensions"));
        }
    }

    #[test]
    fn notes_prompt_embeds_the_notes() {
        let prompt = build_notes_prompt("70 linear feet wood privacy fence");
        assert!(prompt.contains("70 linear feet"));
        assert!(prompt.contains("demolitionNeeded"));
    }
}
