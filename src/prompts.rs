//! System prompts for the text-understanding calls.
//!
//! The JSON shape each prompt asks for must match what
//! [`crate::pipeline::parse`] accepts.
//!
//! Callers can override either prompt via
//! [`crate::config::PipelineConfig::segment_prompt`] and
//! [`crate::config::PipelineConfig::derive_prompt`].

/// Default system prompt for delegated segmentation.
///
/// Asks for `section` plus an optional `prompt` per item; when the model
/// supplies prompts for every section the derivation call is skipped.
pub const DEFAULT_SEGMENT_PROMPT: &str = r#"You split narrative text or dialogue into self-contained visual scenes.

Rules:
1. Keep the original wording of each scene; do not summarise.
2. Preserve the original order.
3. Every part of the input belongs to exactly one scene.
4. A scene is a moment that a single illustration could depict.

Optionally include a vivid, concise image prompt for each scene.

Return ONLY a JSON array, no commentary and no code fences:
[
  { "section": "Original scene text", "prompt": "Image prompt for this scene" }
]"#;

/// Default system prompt for batched prompt derivation.
pub const DEFAULT_DERIVE_PROMPT: &str = r#"You are a visual storytelling expert.
For each paragraph in the JSON array you receive, write one rich, cinematic image prompt.

For each prompt:
- Describe environment, lighting, emotions, and key actions
- Be vivid but concise
- Use present tense
- Include a camera angle or shot type when useful

Return exactly one item per input paragraph, in the same order.
Return ONLY JSON of this shape, no commentary and no code fences:
{ "result": [ { "original": "Paragraph text", "prompt": "Image prompt" } ] }"#;

/// Build the user message for a batched derivation call: the unit texts as a
/// JSON array, so paragraph boundaries survive the round-trip.
pub fn derive_user_message(texts: &[&str]) -> String {
    serde_json::to_string(texts).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_message_is_a_json_array() {
        let msg = derive_user_message(&["First \"quoted\" line", "Second"]);
        let parsed: Vec<String> = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed, vec!["First \"quoted\" line", "Second"]);
    }

    #[test]
    fn prompts_name_the_fields_the_parser_reads() {
        assert!(DEFAULT_SEGMENT_PROMPT.contains("\"section\""));
        assert!(DEFAULT_DERIVE_PROMPT.contains("\"result\""));
        assert!(DEFAULT_DERIVE_PROMPT.contains("\"prompt\""));
    }
}
