//! Defensive parsing of analyzer responses.
//!
//! Analyzer output is untrusted free text that is merely expected to
//! *contain* JSON. Extraction tries, in order: a fenced ```json block, the
//! first balanced object anywhere in the text, and finally regex recovery of
//! individual fields from the raw prose.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use super::fallback;
use super::AnalysisError;

/// A leniently-parsed findings payload. Fields the analyzer omitted or
/// mangled are simply absent; nothing here is trusted yet.
#[derive(Debug, Clone, Default)]
pub struct RawFinding {
    pub project_type: Option<String>,
    pub dimensions: HashMap<String, String>,
    pub materials: Vec<String>,
    pub conditions: Vec<String>,
    pub special_considerations: Vec<String>,
    pub demolition_needed: Option<bool>,
}

impl RawFinding {
    /// Whether the finding carries anything worth keeping.
    pub fn has_signal(&self) -> bool {
        self.project_type.is_some()
            || !self.dimensions.is_empty()
            || !self.materials.is_empty()
            || !self.conditions.is_empty()
            || !self.special_considerations.is_empty()
    }
}

/// Locate a JSON object inside arbitrary analyzer text.
pub fn extract_json_block(text: &str) -> Option<String> {
    // Fenced block first — analyzers that follow instructions use one.
    if let Some(fence_start) = text.find("```json") {
        let body_start = fence_start + 7;
        if let Some(fence_len) = text[body_start..].find("```") {
            let candidate = text[body_start..body_start + fence_len].trim();
            if !candidate.is_empty() {
                return Some(candidate.to_string());
            }
        }
    }

    // Otherwise scan for the first balanced top-level object.
    first_balanced_object(text)
}

/// Scan for the first `{ … }` with balanced braces, respecting strings.
fn first_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse an analyzer response into a `RawFinding`.
/// Fails only when no JSON object can be located or parsed at all;
/// individual malformed fields are dropped, not fatal.
pub fn parse_finding_payload(text: &str) -> Result<RawFinding, AnalysisError> {
    let json = extract_json_block(text)
        .ok_or_else(|| AnalysisError::Parse("no JSON object in analyzer response".into()))?;

    let value: Value = serde_json::from_str(&json)
        .map_err(|e| AnalysisError::Parse(format!("malformed JSON in analyzer response: {e}")))?;

    Ok(finding_from_value(&value))
}

/// Best-effort regex recovery from prose when JSON extraction failed.
/// Recovers the project type from quoted fields and dimensions/materials
/// from the surrounding free text.
pub fn recover_partial(text: &str) -> RawFinding {
    let type_re = Regex::new(r#"(?i)"project_?type"\s*:\s*"([^"]+)""#)
        .expect("project type regex is valid");
    let project_type = type_re
        .captures(text)
        .map(|cap| cap[1].to_string())
        .or_else(|| fallback::detect_project_type(text));

    RawFinding {
        project_type,
        dimensions: fallback::extract_dimensions(text),
        materials: fallback::extract_materials(text),
        demolition_needed: if fallback::detect_demolition(text) {
            Some(true)
        } else {
            None
        },
        ..Default::default()
    }
}

/// Convert a parsed JSON value into a finding, accepting both camelCase and
/// snake_case keys and coercing scalars to strings where needed.
fn finding_from_value(value: &Value) -> RawFinding {
    RawFinding {
        project_type: string_field(value, &["projectType", "project_type"]),
        dimensions: map_field(value, &["dimensions"]),
        materials: list_field(value, &["materials"]),
        conditions: list_field(value, &["conditions"]),
        special_considerations: list_field(
            value,
            &["specialConsiderations", "special_considerations"],
        ),
        demolition_needed: bool_field(value, &["demolitionNeeded", "demolition_needed"]),
    }
}

fn get_any<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(k))
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    get_any(value, keys)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn bool_field(value: &Value, keys: &[&str]) -> Option<bool> {
    get_any(value, keys).and_then(|v| v.as_bool())
}

/// String list; non-string entries are stringified, null/objects dropped.
fn list_field(value: &Value, keys: &[&str]) -> Vec<String> {
    get_any(value, keys)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Object of scalars; numbers are kept as their decimal rendering.
fn map_field(value: &Value, keys: &[&str]) -> HashMap<String, String> {
    get_any(value, keys)
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) if !s.trim().is_empty() => {
                        Some((k.clone(), s.trim().to_string()))
                    }
                    Value::Number(n) => Some((k.clone(), n.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let response = r#"{"projectType": "fencing", "dimensions": {"length": "70 ft", "height": 6}, "materials": ["wood"]}"#;
        let finding = parse_finding_payload(response).unwrap();
        assert_eq!(finding.project_type.as_deref(), Some("fencing"));
        assert_eq!(
            finding.dimensions.get("length").map(String::as_str),
            Some("70 ft")
        );
        assert_eq!(finding.dimensions.get("height").map(String::as_str), Some("6"));
        assert_eq!(finding.materials, vec!["wood"]);
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let response = r#"Sure! {"projectType": "roofing"} Hope that helps!"#;
        let finding = parse_finding_payload(response).unwrap();
        assert_eq!(finding.project_type.as_deref(), Some("roofing"));
    }

    #[test]
    fn parses_fenced_json_block() {
        let response = "Here you go:\n```json\n{\"project_type\": \"deck\", \"materials\": [\"composite\"]}\n```\nAnything else?";
        let finding = parse_finding_payload(response).unwrap();
        assert_eq!(finding.project_type.as_deref(), Some("deck"));
        assert_eq!(finding.materials, vec!["composite"]);
    }

    #[test]
    fn accepts_snake_case_keys() {
        let response = r#"{"project_type": "painting", "special_considerations": ["lead paint"]}"#;
        let finding = parse_finding_payload(response).unwrap();
        assert_eq!(finding.project_type.as_deref(), Some("painting"));
        assert_eq!(finding.special_considerations, vec!["lead paint"]);
    }

    #[test]
    fn nested_braces_in_strings_do_not_break_extraction() {
        let response = r#"note: {"projectType": "deck", "conditions": ["brace } inside"]}"#;
        let finding = parse_finding_payload(response).unwrap();
        assert_eq!(finding.project_type.as_deref(), Some("deck"));
        assert_eq!(finding.conditions, vec!["brace } inside"]);
    }

    #[test]
    fn no_json_at_all_is_a_parse_error() {
        let result = parse_finding_payload("I could not look at the image, sorry.");
        assert!(matches!(result, Err(AnalysisError::Parse(_))));
    }

    #[test]
    fn unbalanced_json_is_a_parse_error() {
        let result = parse_finding_payload(r#"{"projectType": "fencing""#);
        assert!(matches!(result, Err(AnalysisError::Parse(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let result = parse_finding_payload("{not json at all}");
        assert!(matches!(result, Err(AnalysisError::Parse(_))));
    }

    #[test]
    fn recover_partial_reads_quoted_type_from_broken_json() {
        let text = r#"```json
{"projectType": "roofing", "dimensions": {broken
```"#;
        let finding = recover_partial(text);
        assert_eq!(finding.project_type.as_deref(), Some("roofing"));
    }

    #[test]
    fn recover_partial_extracts_from_prose() {
        let text = "The photo shows a wood privacy fence about 70 linear feet long and 6 feet tall.";
        let finding = recover_partial(text);
        assert_eq!(finding.project_type.as_deref(), Some("fencing"));
        assert_eq!(finding.dimensions.get("length").map(String::as_str), Some("70"));
        assert!(finding.materials.contains(&"wood".to_string()));
        assert!(finding.has_signal());
    }

    #[test]
    fn recover_partial_on_empty_text_has_no_signal() {
        let finding = recover_partial("nothing useful here");
        assert!(!finding.has_signal());
    }

    #[test]
    fn null_and_object_entries_are_dropped_from_lists() {
        let response = r#"{"materials": ["wood", null, {"x": 1}, 42, "  "]}"#;
        let finding = parse_finding_payload(response).unwrap();
        assert_eq!(finding.materials, vec!["wood", "42"]);
    }

    #[test]
    fn demolition_flag_is_read() {
        let response = r#"{"projectType": "fencing", "demolitionNeeded": true}"#;
        let finding = parse_finding_payload(response).unwrap();
        assert_eq!(finding.demolition_needed, Some(true));
    }
}
