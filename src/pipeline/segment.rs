//! Segmentation: raw text → ordered unit seeds.
//!
//! Structural mode splits on blank lines and never fails beyond "no
//! scenes". Delegated mode asks the text provider for a JSON scene list and
//! validates it through [`crate::pipeline::parse`]; a model that answers in
//! prose is an error, not one giant scene.

use crate::config::{PipelineConfig, SegmentMode};
use crate::error::{StoryboardError, UpstreamStage};
use crate::pipeline::parse;
use crate::prompts::DEFAULT_SEGMENT_PROMPT;
use crate::provider::TextProvider;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::{debug, info};

/// Two or more line breaks, allowing whitespace-only lines in between.
static RE_BLANK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n(?:[ \t]*\n)+").unwrap());

/// A work unit before its prompt is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSeed {
    pub index: usize,
    pub source_text: String,
    /// Set when delegated segmentation also wrote the image prompt.
    pub prompt: Option<String>,
}

/// Split on blank-line boundaries, trim, and drop empty paragraphs.
pub fn split_paragraphs(text: &str) -> Vec<UnitSeed> {
    let normalised = text.replace("\r\n", "\n").replace('\r', "\n");
    RE_BLANK_LINE
        .split(&normalised)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(index, p)| UnitSeed {
            index,
            source_text: p.to_string(),
            prompt: None,
        })
        .collect()
}

/// Segment `text` according to `config.segment_mode`.
///
/// Input that is blank after trimming fails with
/// [`StoryboardError::EmptyInput`] before any provider is called.
pub async fn segment(
    text: &str,
    config: &PipelineConfig,
    provider: Option<&dyn TextProvider>,
) -> Result<Vec<UnitSeed>, StoryboardError> {
    if text.trim().is_empty() {
        return Err(StoryboardError::EmptyInput);
    }

    let seeds = match config.segment_mode {
        SegmentMode::Structural => split_paragraphs(text),
        SegmentMode::Delegated => {
            let provider = provider.ok_or_else(|| {
                StoryboardError::Internal("delegated segmentation without a text provider".into())
            })?;
            segment_delegated(text, config, provider).await?
        }
    };

    if seeds.is_empty() {
        return Err(StoryboardError::EmptyInput);
    }
    info!("Segmented input into {} scenes", seeds.len());
    Ok(seeds)
}

async fn segment_delegated(
    text: &str,
    config: &PipelineConfig,
    provider: &dyn TextProvider,
) -> Result<Vec<UnitSeed>, StoryboardError> {
    let system = config
        .segment_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SEGMENT_PROMPT);

    debug!("Requesting segmentation from {}", provider.name());
    let raw = call_text_provider(
        provider,
        system,
        text.trim(),
        config.api_timeout_secs,
        UpstreamStage::Segmentation,
    )
    .await?;

    let sections = parse::parse_sections(&raw)?;
    Ok(sections
        .into_iter()
        .enumerate()
        .map(|(index, s)| UnitSeed {
            index,
            source_text: s.text,
            prompt: s.prompt,
        })
        .collect())
}

/// One bounded text-provider call, with transport failures mapped to
/// [`StoryboardError::UpstreamUnavailable`].
pub(crate) async fn call_text_provider(
    provider: &dyn TextProvider,
    system: &str,
    user: &str,
    timeout_secs: u64,
    stage: UpstreamStage,
) -> Result<String, StoryboardError> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), provider.complete(system, user)).await {
        Ok(Ok(raw)) => Ok(raw),
        Ok(Err(e)) => Err(StoryboardError::UpstreamUnavailable {
            stage,
            detail: e.to_string(),
        }),
        Err(_) => Err(StoryboardError::UpstreamUnavailable {
            stage,
            detail: format!("no response within {timeout_secs}s"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use async_trait::async_trait;

    struct Canned(&'static str);

    #[async_trait]
    impl TextProvider for Canned {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, ProviderError> {
            Ok(self.0.to_string())
        }
        fn name(&self) -> &str {
            "canned"
        }
    }

    struct Down;

    #[async_trait]
    impl TextProvider for Down {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, ProviderError> {
            Err(ProviderError::Unavailable {
                detail: "connection refused".into(),
            })
        }
        fn name(&self) -> &str {
            "down"
        }
    }

    fn delegated() -> PipelineConfig {
        PipelineConfig::builder()
            .segment_mode(SegmentMode::Delegated)
            .build()
            .unwrap()
    }

    #[test]
    fn split_on_blank_lines() {
        let seeds = split_paragraphs("First scene.\n\nSecond scene.\n\n\n\nThird scene.");
        let texts: Vec<&str> = seeds.iter().map(|s| s.source_text.as_str()).collect();
        assert_eq!(texts, vec!["First scene.", "Second scene.", "Third scene."]);
        assert_eq!(seeds[2].index, 2);
    }

    #[test]
    fn single_newlines_stay_inside_a_scene() {
        let seeds = split_paragraphs("Line one\nline two\n\nNext");
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].source_text, "Line one\nline two");
    }

    #[test]
    fn crlf_and_whitespace_only_lines_split() {
        let seeds = split_paragraphs("  A  \r\n \t \r\nB\r\n\r\n");
        let texts: Vec<&str> = seeds.iter().map(|s| s.source_text.as_str()).collect();
        assert_eq!(texts, vec!["A", "B"]);
    }

    #[test]
    fn blank_input_has_no_seeds() {
        assert!(split_paragraphs("\n\n   \n\n").is_empty());
    }

    #[tokio::test]
    async fn blank_input_fails_before_provider() {
        let err = segment("   \n\n ", &delegated(), None).await.unwrap_err();
        assert!(matches!(err, StoryboardError::EmptyInput));
    }

    #[tokio::test]
    async fn delegated_keeps_provider_prompts() {
        let provider = Canned(r#"[{"section": "Storm", "prompt": "dark sea"}, {"section": "Calm"}]"#);
        let seeds = segment("Storm. Calm.", &delegated(), Some(&provider)).await.unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].prompt.as_deref(), Some("dark sea"));
        assert_eq!(seeds[1].prompt, None);
    }

    #[tokio::test]
    async fn delegated_prose_is_format_error() {
        let provider = Canned("I'd split this into two scenes.");
        let err = segment("Storm. Calm.", &delegated(), Some(&provider)).await.unwrap_err();
        assert!(matches!(err, StoryboardError::UpstreamFormat { .. }));
    }

    #[tokio::test]
    async fn delegated_transport_failure_is_unavailable() {
        let err = segment("Storm. Calm.", &delegated(), Some(&Down)).await.unwrap_err();
        assert!(matches!(
            err,
            StoryboardError::UpstreamUnavailable {
                stage: UpstreamStage::Segmentation,
                ..
            }
        ));
    }
}
