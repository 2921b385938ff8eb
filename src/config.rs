//! Configuration types for a storyboard run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The rate-limit knobs live in their own
//! [`RunnerConfig`] so a pacing profile can be serialised, logged, and
//! swapped independently of provider choice.
//!
//! Two presets cover the two execution styles a caller usually wants:
//! [`RunnerConfig::throttled`] (one request at a time, minutes apart) and
//! [`RunnerConfig::fan_out`] (bounded concurrency, no spacing).

use crate::error::StoryboardError;
use crate::progress::ProgressCallback;
use crate::provider::{ImageProvider, TextProvider};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Pacing, retry, and concurrency settings for the job runner.
///
/// All durations are milliseconds so the struct round-trips through JSON or
/// environment variables without a custom duration format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Minimum spacing between any two image submissions, across all workers.
    pub min_interval_ms: u64,

    /// Retries per unit after the first attempt. A unit makes at most
    /// `max_retries + 1` submissions.
    pub max_retries: u32,

    /// First back-off delay; doubles per failed attempt.
    pub backoff_base_ms: u64,

    /// Upper bound on any single back-off delay.
    pub backoff_cap_ms: u64,

    /// Workers pulling units in index order. 1 = strictly serial.
    ///
    /// Concurrency never raises the submission rate above what
    /// `min_interval_ms` allows; it overlaps waiting and provider latency.
    pub concurrency: usize,

    /// Extra batch-wide hold applied after a throttling response, before the
    /// next submission of any unit.
    pub throttle_cooldown_ms: u64,

    /// Hold before the very first submission of the run.
    pub warmup_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
            max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
            concurrency: 1,
            throttle_cooldown_ms: 10_000,
            warmup_ms: 0,
        }
    }
}

impl RunnerConfig {
    /// Strictly serial profile for providers with very low per-minute quotas.
    ///
    /// Two minutes between requests, a two-minute warm-up, three attempts per
    /// unit with 60 s → 120 s back-off (capped at 5 min), and a three-minute
    /// batch-wide cooldown after any throttle.
    pub fn throttled() -> Self {
        Self {
            min_interval_ms: 120_000,
            max_retries: 2,
            backoff_base_ms: 60_000,
            backoff_cap_ms: 300_000,
            concurrency: 1,
            throttle_cooldown_ms: 180_000,
            warmup_ms: 120_000,
        }
    }

    /// Unpaced bounded fan-out for providers with generous limits.
    pub fn fan_out(concurrency: usize) -> Self {
        Self {
            min_interval_ms: 0,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            concurrency: concurrency.max(1),
            throttle_cooldown_ms: 2_000,
            warmup_ms: 0,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn throttle_cooldown(&self) -> Duration {
        Duration::from_millis(self.throttle_cooldown_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Back-off after the `attempts_used`-th failed attempt:
    /// `min(cap, base * 2^(attempts_used - 1))`.
    pub fn backoff_delay(&self, attempts_used: u32) -> Duration {
        let exponent = attempts_used.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    /// Back-off honouring a server-supplied delay, still bounded by the cap.
    pub fn retry_delay(&self, attempts_used: u32, retry_after_ms: Option<u64>) -> Duration {
        let backoff = self.backoff_delay(attempts_used);
        match retry_after_ms {
            Some(ms) => backoff
                .max(Duration::from_millis(ms))
                .min(Duration::from_millis(self.backoff_cap_ms)),
            None => backoff,
        }
    }
}

/// How raw text is split into work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentMode {
    /// Split on blank lines locally. No provider call. (default)
    #[default]
    Structural,
    /// Ask the text provider to split the text into scenes.
    Delegated,
}

/// How each unit's image prompt is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// The unit text is the prompt.
    Identity,
    /// One batched text-provider call writes a cinematic prompt per unit. (default)
    #[default]
    Delegated,
}

/// Quality hint forwarded to the image provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    #[default]
    Standard,
    Hd,
}

impl ImageQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageQuality::Standard => "standard",
            ImageQuality::Hd => "hd",
        }
    }
}

/// Output encoding requested from providers that let the caller choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
        }
    }
}

/// Per-request image generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Image model identifier. Default: `dall-e-3`.
    pub model: String,
    /// `WIDTHxHEIGHT`. Default: `1024x1024`.
    pub size: String,
    pub quality: ImageQuality,
    /// Only sent when set; not every model accepts it.
    pub output_format: Option<OutputFormat>,
    /// Per-request HTTP timeout in seconds, including the payload fetch. Default: 120.
    pub request_timeout_secs: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: "dall-e-3".to_string(),
            size: "1024x1024".to_string(),
            quality: ImageQuality::Standard,
            output_format: None,
            request_timeout_secs: 120,
        }
    }
}

/// Configuration for a text → images → archive run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use storyboard_gen::{PipelineConfig, RunnerConfig, SegmentMode};
///
/// let config = PipelineConfig::builder()
///     .runner(RunnerConfig::fan_out(4))
///     .segment_mode(SegmentMode::Structural)
///     .batch_timeout_secs(600)
///     .build()
///     .unwrap();
/// assert_eq!(config.runner.concurrency, 4);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Pacing, retry, and concurrency profile.
    pub runner: RunnerConfig,

    pub segment_mode: SegmentMode,

    pub prompt_mode: PromptMode,

    pub generation: GenerationParams,

    /// Text model used for delegated segmentation and prompt derivation.
    /// If None, uses `gpt-4o-mini` for named providers.
    pub text_model: Option<String>,

    /// Text provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `text_provider`, auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed text provider. Takes precedence over `provider_name`.
    pub text_provider: Option<Arc<dyn TextProvider>>,

    /// Pre-constructed image provider. If None, the OpenAI images client is
    /// built from `OPENAI_API_KEY`.
    pub image_provider: Option<Arc<dyn ImageProvider>>,

    /// Sampling temperature for text calls. Default: 0.7.
    pub temperature: f32,

    /// Maximum tokens per text call. Default: 4096.
    pub max_tokens: usize,

    /// Custom segmentation system prompt.
    pub segment_prompt: Option<String>,

    /// Custom prompt-derivation system prompt.
    pub derive_prompt: Option<String>,

    /// Per text-provider call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Cancel the whole run once this budget is spent. Default: None.
    pub batch_timeout_secs: Option<u64>,

    /// Append `manifest.json` describing every unit to the archive. Default: true.
    pub include_manifest: bool,

    /// Optional per-unit event sink.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            segment_mode: SegmentMode::default(),
            prompt_mode: PromptMode::default(),
            generation: GenerationParams::default(),
            text_model: None,
            provider_name: None,
            text_provider: None,
            image_provider: None,
            temperature: 0.7,
            max_tokens: 4096,
            segment_prompt: None,
            derive_prompt: None,
            api_timeout_secs: 120,
            batch_timeout_secs: None,
            include_manifest: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("runner", &self.runner)
            .field("segment_mode", &self.segment_mode)
            .field("prompt_mode", &self.prompt_mode)
            .field("generation", &self.generation)
            .field("text_model", &self.text_model)
            .field("provider_name", &self.provider_name)
            .field("text_provider", &self.text_provider.as_ref().map(|p| p.name().to_string()))
            .field("image_provider", &self.image_provider.as_ref().map(|p| p.name().to_string()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("batch_timeout_secs", &self.batch_timeout_secs)
            .field("include_manifest", &self.include_manifest)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// True when any stage needs the text provider.
    pub fn needs_text_provider(&self) -> bool {
        self.segment_mode == SegmentMode::Delegated || self.prompt_mode == PromptMode::Delegated
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn runner(mut self, runner: RunnerConfig) -> Self {
        self.config.runner = runner;
        self
    }

    pub fn min_interval_ms(mut self, ms: u64) -> Self {
        self.config.runner.min_interval_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.runner.max_retries = n;
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.config.runner.backoff_base_ms = ms;
        self
    }

    pub fn backoff_cap_ms(mut self, ms: u64) -> Self {
        self.config.runner.backoff_cap_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.runner.concurrency = n.max(1);
        self
    }

    pub fn throttle_cooldown_ms(mut self, ms: u64) -> Self {
        self.config.runner.throttle_cooldown_ms = ms;
        self
    }

    pub fn warmup_ms(mut self, ms: u64) -> Self {
        self.config.runner.warmup_ms = ms;
        self
    }

    pub fn segment_mode(mut self, mode: SegmentMode) -> Self {
        self.config.segment_mode = mode;
        self
    }

    pub fn prompt_mode(mut self, mode: PromptMode) -> Self {
        self.config.prompt_mode = mode;
        self
    }

    pub fn generation(mut self, params: GenerationParams) -> Self {
        self.config.generation = params;
        self
    }

    pub fn image_model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn image_size(mut self, size: impl Into<String>) -> Self {
        self.config.generation.size = size.into();
        self
    }

    pub fn image_quality(mut self, quality: ImageQuality) -> Self {
        self.config.generation.quality = quality;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.generation.output_format = Some(format);
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn text_provider(mut self, provider: Arc<dyn TextProvider>) -> Self {
        self.config.text_provider = Some(provider);
        self
    }

    pub fn image_provider(mut self, provider: Arc<dyn ImageProvider>) -> Self {
        self.config.image_provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn segment_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.segment_prompt = Some(prompt.into());
        self
    }

    pub fn derive_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.derive_prompt = Some(prompt.into());
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn batch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.batch_timeout_secs = Some(secs);
        self
    }

    pub fn include_manifest(mut self, v: bool) -> Self {
        self.config.include_manifest = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, StoryboardError> {
        let r = &self.config.runner;
        if r.concurrency == 0 {
            return Err(StoryboardError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if r.backoff_cap_ms < r.backoff_base_ms {
            return Err(StoryboardError::InvalidConfig(format!(
                "Back-off cap ({}ms) is below the back-off base ({}ms)",
                r.backoff_cap_ms, r.backoff_base_ms
            )));
        }
        if !is_valid_size(&self.config.generation.size) {
            return Err(StoryboardError::InvalidConfig(format!(
                "Image size must be WIDTHxHEIGHT, got '{}'",
                self.config.generation.size
            )));
        }
        if self.config.api_timeout_secs == 0 {
            return Err(StoryboardError::InvalidConfig(
                "API timeout must be at least one second".into(),
            ));
        }
        Ok(self.config)
    }
}

fn is_valid_size(size: &str) -> bool {
    match size.split_once('x') {
        Some((w, h)) => {
            matches!(w.parse::<u32>(), Ok(w) if w > 0) && matches!(h.parse::<u32>(), Ok(h) if h > 0)
        }
        None => false,
    }
}
