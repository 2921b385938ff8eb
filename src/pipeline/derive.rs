//! Prompt derivation: unit seeds → work units with image prompts.
//!
//! One batched text-provider call covers every unit. The response must hold
//! exactly one prompt per submitted unit; a short or long answer is an
//! error rather than something to zip and truncate.

use crate::config::{PipelineConfig, PromptMode};
use crate::error::{StoryboardError, UpstreamStage};
use crate::output::WorkUnit;
use crate::pipeline::parse;
use crate::pipeline::segment::{call_text_provider, UnitSeed};
use crate::prompts::{derive_user_message, DEFAULT_DERIVE_PROMPT};
use crate::provider::TextProvider;
use tracing::{debug, info};

/// Attach a prompt to every seed.
///
/// Seeds that already carry prompts for every unit (delegated segmentation
/// wrote them) skip the derivation call regardless of mode.
pub async fn derive_prompts(
    seeds: Vec<UnitSeed>,
    config: &PipelineConfig,
    provider: Option<&dyn TextProvider>,
) -> Result<Vec<WorkUnit>, StoryboardError> {
    if !seeds.is_empty() && seeds.iter().all(|s| s.prompt.is_some()) {
        debug!("Segmentation supplied prompts for all {} scenes", seeds.len());
        return Ok(seeds.into_iter().map(identity_or_given).collect());
    }

    match config.prompt_mode {
        PromptMode::Identity => Ok(seeds.into_iter().map(identity_or_given).collect()),
        PromptMode::Delegated => {
            let provider = provider.ok_or_else(|| {
                StoryboardError::Internal("delegated prompt derivation without a text provider".into())
            })?;
            derive_delegated(seeds, config, provider).await
        }
    }
}

fn identity_or_given(seed: UnitSeed) -> WorkUnit {
    let prompt = seed.prompt.unwrap_or_else(|| seed.source_text.clone());
    WorkUnit {
        index: seed.index,
        source_text: seed.source_text,
        prompt,
    }
}

async fn derive_delegated(
    seeds: Vec<UnitSeed>,
    config: &PipelineConfig,
    provider: &dyn TextProvider,
) -> Result<Vec<WorkUnit>, StoryboardError> {
    let system = config.derive_prompt.as_deref().unwrap_or(DEFAULT_DERIVE_PROMPT);
    let texts: Vec<&str> = seeds.iter().map(|s| s.source_text.as_str()).collect();
    let user = derive_user_message(&texts);

    debug!("Requesting {} prompts from {}", seeds.len(), provider.name());
    let raw = call_text_provider(
        provider,
        system,
        &user,
        config.api_timeout_secs,
        UpstreamStage::PromptDerivation,
    )
    .await?;

    let prompts = parse::parse_prompts(&raw, seeds.len())?;
    info!("Derived {} image prompts", prompts.len());

    Ok(seeds
        .into_iter()
        .zip(prompts)
        .map(|(seed, prompt)| WorkUnit {
            index: seed.index,
            source_text: seed.source_text,
            prompt,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        reply: String,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TextProvider for Scripted {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(user.starts_with('['), "batched call sends a JSON array");
            Ok(self.reply.clone())
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn seeds(n: usize) -> Vec<UnitSeed> {
        (0..n)
            .map(|i| UnitSeed {
                index: i,
                source_text: format!("Paragraph {i}"),
                prompt: None,
            })
            .collect()
    }

    fn delegated() -> PipelineConfig {
        PipelineConfig::builder()
            .prompt_mode(PromptMode::Delegated)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn identity_uses_source_text() {
        let config = PipelineConfig::builder()
            .prompt_mode(PromptMode::Identity)
            .build()
            .unwrap();
        let units = derive_prompts(seeds(2), &config, None).await.unwrap();
        assert_eq!(units[1].prompt, "Paragraph 1");
    }

    #[tokio::test]
    async fn delegated_attaches_prompts_in_order() {
        let provider = Scripted::new(r#"{"result": [{"prompt": "p0"}, {"prompt": "p1"}]}"#);
        let units = derive_prompts(seeds(2), &delegated(), Some(&provider)).await.unwrap();
        assert_eq!(units[0].prompt, "p0");
        assert_eq!(units[1].prompt, "p1");
        assert_eq!(units[1].source_text, "Paragraph 1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn count_mismatch_is_format_error() {
        let provider = Scripted::new(r#"["only one"]"#);
        let err = derive_prompts(seeds(2), &delegated(), Some(&provider)).await.unwrap_err();
        assert!(matches!(
            err,
            StoryboardError::UpstreamFormat {
                stage: UpstreamStage::PromptDerivation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn segmenter_prompts_skip_the_call() {
        let provider = Scripted::new("unused");
        let mut s = seeds(2);
        for seed in &mut s {
            seed.prompt = Some(format!("given {}", seed.index));
        }
        let units = derive_prompts(s, &delegated(), Some(&provider)).await.unwrap();
        assert_eq!(units[0].prompt, "given 0");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
