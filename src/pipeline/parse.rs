//! Parse-and-validate for text-provider responses.
//!
//! Language models are asked for JSON but answer with whatever they like:
//! a bare array, an object wrapping the array, a fenced code block, or
//! prose. Every response goes through this module and comes out either as
//! typed items or as [`StoryboardError::UpstreamFormat`]. Nothing
//! downstream reads a `serde_json::Value` directly.
//!
//! Accepted envelope shapes, in order:
//! 1. `[ ... ]`
//! 2. `{ "result" | "sections" | "scenes" | "prompts": [ ... ] }`
//!
//! Either may be wrapped in a ```` ```json ```` fence.

use crate::error::{StoryboardError, UpstreamStage};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Object keys under which a wrapped item array may appear.
const ENVELOPE_KEYS: &[&str] = &["result", "sections", "scenes", "prompts"];

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n(.*?)\n?```\s*$").unwrap());

/// A section returned by delegated segmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSection {
    pub text: String,
    pub prompt: Option<String>,
}

/// Strip a single outer code fence, if present.
pub fn strip_code_fence(input: &str) -> &str {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim()).unwrap_or(trimmed),
        None => trimmed,
    }
}

fn format_error(stage: UpstreamStage, detail: impl Into<String>) -> StoryboardError {
    StoryboardError::UpstreamFormat {
        stage,
        detail: detail.into(),
    }
}

/// Parse the response envelope into its item array.
pub fn parse_items(raw: &str, stage: UpstreamStage) -> Result<Vec<Value>, StoryboardError> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return Err(format_error(stage, "empty response"));
    }

    let value: Value = serde_json::from_str(body).map_err(|e| {
        format_error(
            stage,
            format!("response is not JSON ({e}); starts with {:?}", preview(body)),
        )
    })?;

    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ENVELOPE_KEYS {
                if let Some(Value::Array(items)) = map.remove(*key) {
                    return Ok(items);
                }
            }
            let keys: Vec<&String> = map.keys().collect();
            Err(format_error(
                stage,
                format!("expected a JSON array or an object wrapping one, got object with keys {keys:?}"),
            ))
        }
        other => Err(format_error(
            stage,
            format!("expected a JSON array, got {}", json_type(&other)),
        )),
    }
}

/// Parse a segmentation response into sections.
///
/// Each item is either a string or an object with a non-empty `section`
/// (or `text` / `original`) string and an optional `prompt` string.
pub fn parse_sections(raw: &str) -> Result<Vec<ParsedSection>, StoryboardError> {
    let stage = UpstreamStage::Segmentation;
    let items = parse_items(raw, stage)?;
    if items.is_empty() {
        return Err(format_error(stage, "response contained no sections"));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(s) => non_empty(s)
                .map(|text| ParsedSection { text, prompt: None })
                .ok_or_else(|| format_error(stage, format!("item {i} is an empty string"))),
            Value::Object(map) => {
                let text = ["section", "text", "original"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str).and_then(non_empty))
                    .ok_or_else(|| {
                        format_error(stage, format!("item {i} has no non-empty \"section\" string"))
                    })?;
                let prompt = match map.get("prompt") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(p)) => non_empty(p),
                    Some(other) => {
                        return Err(format_error(
                            stage,
                            format!("item {i} has a non-string \"prompt\" ({})", json_type(other)),
                        ))
                    }
                };
                Ok(ParsedSection { text, prompt })
            }
            other => Err(format_error(
                stage,
                format!("item {i} is {}, expected string or object", json_type(other)),
            )),
        })
        .collect()
}

/// Parse a batched prompt-derivation response, requiring exactly `expected`
/// prompts in submission order.
pub fn parse_prompts(raw: &str, expected: usize) -> Result<Vec<String>, StoryboardError> {
    let stage = UpstreamStage::PromptDerivation;
    let items = parse_items(raw, stage)?;
    if items.len() != expected {
        return Err(format_error(
            stage,
            format!("expected {expected} prompts, got {}", items.len()),
        ));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let prompt = match item {
                Value::String(s) => non_empty(s),
                Value::Object(map) => map.get("prompt").and_then(Value::as_str).and_then(non_empty),
                _ => None,
            };
            prompt.ok_or_else(|| {
                format_error(stage, format!("item {i} has no non-empty \"prompt\" string"))
            })
        })
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn preview(s: &str) -> String {
    s.chars().take(60).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_json_fence() {
        assert_eq!(strip_code_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("  [1]  "), "[1]");
    }

    #[test]
    fn bare_array_of_sections() {
        let raw = r#"[{"section": "A knock at the door."}, {"section": "She opens it.", "prompt": "doorway, night"}]"#;
        let sections = parse_sections(raw).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].prompt, None);
        assert_eq!(sections[1].prompt.as_deref(), Some("doorway, night"));
    }

    #[test]
    fn wrapped_and_fenced_sections() {
        let raw = "```json\n{\"sections\": [\"One\", \"Two\"]}\n```";
        let sections = parse_sections(raw).unwrap();
        assert_eq!(sections[1].text, "Two");
    }

    #[test]
    fn prose_is_rejected_not_accepted_as_one_unit() {
        let err = parse_sections("Sure! Here are the scenes: first the storm, then the calm.").unwrap_err();
        assert!(matches!(
            err,
            StoryboardError::UpstreamFormat {
                stage: UpstreamStage::Segmentation,
                ..
            }
        ));
    }

    #[test]
    fn object_without_array_is_rejected() {
        let err = parse_sections(r#"{"section": "just one"}"#).unwrap_err();
        assert!(err.to_string().contains("keys"), "got: {err}");
    }

    #[test]
    fn section_missing_text_is_rejected() {
        assert!(parse_sections(r#"[{"prompt": "only a prompt"}]"#).is_err());
        assert!(parse_sections(r#"[{"section": "   "}]"#).is_err());
        assert!(parse_sections("[42]").is_err());
        assert!(parse_sections("[]").is_err());
    }

    #[test]
    fn prompts_from_result_envelope() {
        let raw = r#"{"result": [{"original": "a", "prompt": "wide shot"}, {"original": "b", "prompt": "close-up"}]}"#;
        assert_eq!(parse_prompts(raw, 2).unwrap(), vec!["wide shot", "close-up"]);
    }

    #[test]
    fn prompt_count_mismatch_is_format_error() {
        let raw = r#"["one", "two"]"#;
        let err = parse_prompts(raw, 3).unwrap_err();
        assert!(err.to_string().contains("expected 3 prompts, got 2"), "got: {err}");
    }

    #[test]
    fn prompt_item_without_prompt_field_is_rejected() {
        let raw = r#"[{"original": "a"}]"#;
        assert!(parse_prompts(raw, 1).is_err());
    }
}
