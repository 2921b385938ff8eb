//! Provider seams: text understanding and image generation.
//!
//! The pipeline talks to the outside world through two object-safe traits.
//! [`TextProvider`] backs delegated segmentation and prompt derivation;
//! [`ImageProvider`] backs the job runner. Stub implementations of both make
//! the whole pipeline testable without network access.
//!
//! Concrete implementations:
//! - [`LlmTextProvider`] adapts any `edgequake_llm::LLMProvider` (OpenAI,
//!   Anthropic, Gemini, Ollama, …).
//! - [`OpenAiImageProvider`] calls an OpenAI-compatible
//!   `/images/generations` endpoint and resolves URL responses to bytes
//!   immediately, since hosted image URLs expire.

use crate::config::{GenerationParams, PipelineConfig};
use crate::error::{ProviderError, StoryboardError};
use crate::output::ImagePayload;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A text-understanding service: one system prompt, one user message, one
/// text completion back.
#[async_trait]
pub trait TextProvider: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

/// An image-generation service: one prompt in, one image out.
///
/// Implementations must classify failures: [`ProviderError::Throttled`] for
/// rate-limit signals, [`ProviderError::Rejected`] for requests that will
/// never succeed, [`ProviderError::Unavailable`] for everything transient.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ImagePayload, ProviderError>;

    fn name(&self) -> &str;
}

// ── Text provider over edgequake-llm ─────────────────────────────────────────

/// [`TextProvider`] backed by an `edgequake_llm` chat provider.
pub struct LlmTextProvider {
    inner: Arc<dyn LLMProvider>,
    label: String,
    temperature: f32,
    max_tokens: usize,
}

impl LlmTextProvider {
    pub fn new(inner: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn build_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TextProvider for LlmTextProvider {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let options = self.build_options();
        match self.inner.chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    "{}: {} input tokens, {} output tokens",
                    self.label, response.prompt_tokens, response.completion_tokens
                );
                Ok(response.content)
            }
            Err(e) => Err(ProviderError::Unavailable {
                detail: format!("{}", e),
            }),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

// ── OpenAI-compatible image provider ─────────────────────────────────────────

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct ImagesRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    quality: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_format: Option<&'a str>,
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    url: Option<String>,
    b64_json: Option<String>,
}

/// Client for `POST {base_url}/images/generations`.
pub struct OpenAiImageProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiImageProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoryboardError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| StoryboardError::Internal(format!("Failed to create HTTP client: {e}")))?;
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url,
        })
    }

    /// Build from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env(timeout: Duration) -> Result<Self, StoryboardError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StoryboardError::ProviderNotConfigured {
                provider: "openai-images".to_string(),
                hint: "Set OPENAI_API_KEY or pass an image provider in the config.".to_string(),
            })?;
        let base_url = std::env::var("OPENAI_BASE_URL").ok().filter(|u| !u.is_empty());
        Self::new(api_key, base_url, timeout)
    }

    /// Fetch a hosted image right away; the URL is not assumed to outlive
    /// this attempt.
    async fn fetch_url(&self, url: &str) -> Result<ImagePayload, ProviderError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Unavailable {
                detail: format!("image download returned HTTP {status}"),
            });
        }
        let mime_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = response.bytes().await.map_err(|e| transport_error(&e))?;
        debug!("Fetched {} image bytes from provider URL", bytes.len());
        Ok(ImagePayload::new(bytes.to_vec(), mime_type))
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageProvider {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ImagePayload, ProviderError> {
        let body = ImagesRequest {
            model: &params.model,
            prompt,
            n: 1,
            size: &params.size,
            quality: params.quality.as_str(),
            output_format: params.output_format.map(|f| f.as_str()),
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = retry_after_ms(response.headers());
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after_ms, detail));
        }

        let parsed: ImagesResponse = response.json().await.map_err(|e| ProviderError::Rejected {
            status: Some(status.as_u16()),
            detail: format!("unreadable images response: {e}"),
        })?;

        let datum = parsed.data.into_iter().next().ok_or_else(|| ProviderError::Rejected {
            status: Some(status.as_u16()),
            detail: "response carried no image".to_string(),
        })?;

        match (datum.b64_json, datum.url) {
            (Some(b64), _) => {
                let bytes = STANDARD.decode(b64.trim()).map_err(|e| ProviderError::Rejected {
                    status: Some(status.as_u16()),
                    detail: format!("invalid base64 image: {e}"),
                })?;
                let mime_type = params.output_format.map(|f| format!("image/{}", f.as_str()));
                Ok(ImagePayload::new(bytes, mime_type))
            }
            (None, Some(url)) => self.fetch_url(&url).await,
            (None, None) => Err(ProviderError::Rejected {
                status: Some(status.as_u16()),
                detail: "image entry has neither url nor b64_json".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "openai-images"
    }
}

/// Map an HTTP error status to the provider error taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after_ms: Option<u64>,
    detail: String,
) -> ProviderError {
    let detail = truncate(detail.trim(), 300);
    match status.as_u16() {
        429 => ProviderError::Throttled { retry_after_ms },
        408 => ProviderError::Unavailable { detail },
        400..=499 => ProviderError::Rejected {
            status: Some(status.as_u16()),
            detail,
        },
        _ => ProviderError::Unavailable {
            detail: format!("HTTP {status}: {detail}"),
        },
    }
}

fn retry_after_ms(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
}

fn transport_error(e: &reqwest::Error) -> ProviderError {
    let detail = if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection error: {e}")
    } else {
        format!("HTTP error: {e}")
    };
    ProviderError::Unavailable { detail }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('\u{2026}');
        out
    }
}

// ── Provider resolution ──────────────────────────────────────────────────────

/// Instantiate a named chat provider with the given model.
fn create_text_provider(
    provider_name: &str,
    model: &str,
    config: &PipelineConfig,
) -> Result<Arc<dyn TextProvider>, StoryboardError> {
    let llm = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        StoryboardError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok(Arc::new(
        LlmTextProvider::new(llm, format!("{provider_name}/{model}"))
            .with_sampling(config.temperature, config.max_tokens),
    ))
}

/// Resolve the text provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.text_provider`): used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key present**: OpenAI with the configured or default model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_text_provider(
    config: &PipelineConfig,
) -> Result<Arc<dyn TextProvider>, StoryboardError> {
    if let Some(ref provider) = config.text_provider {
        return Ok(Arc::clone(provider));
    }

    let default_model = config.text_model.as_deref().unwrap_or("gpt-4o-mini");

    if let Some(ref name) = config.provider_name {
        return create_text_provider(name, default_model, config);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_text_provider(&prov, &model, config);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_text_provider("openai", default_model, config);
        }
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| StoryboardError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No text provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;
    warn!("Text provider auto-detected from environment");
    Ok(Arc::new(
        LlmTextProvider::new(llm, "auto").with_sampling(config.temperature, config.max_tokens),
    ))
}

/// Resolve the image provider: pre-built instance, else OpenAI from the environment.
pub fn resolve_image_provider(
    config: &PipelineConfig,
) -> Result<Arc<dyn ImageProvider>, StoryboardError> {
    if let Some(ref provider) = config.image_provider {
        return Ok(Arc::clone(provider));
    }
    let timeout = Duration::from_secs(config.generation.request_timeout_secs.max(1));
    Ok(Arc::new(OpenAiImageProvider::from_env(timeout)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_throttle_with_retry_after() {
        let e = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3000), String::new());
        assert_eq!(
            e,
            ProviderError::Throttled {
                retry_after_ms: Some(3000)
            }
        );
    }

    #[test]
    fn status_400_is_rejection() {
        let e = classify_status(StatusCode::BAD_REQUEST, None, "content_policy_violation".into());
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("content_policy_violation"));
    }

    #[test]
    fn status_5xx_and_408_are_transient() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, None, String::new()).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, None, String::new()).is_retryable());
    }

    #[test]
    fn retry_after_seconds_become_millis() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, header::HeaderValue::from_static("7"));
        assert_eq!(retry_after_ms(&headers), Some(7000));
        headers.insert(
            header::RETRY_AFTER,
            header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after_ms(&headers), None);
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let long = "x".repeat(1000);
        match classify_status(StatusCode::BAD_REQUEST, None, long) {
            ProviderError::Rejected { detail, .. } => assert_eq!(detail.chars().count(), 301),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn images_request_omits_unset_output_format() {
        let body = ImagesRequest {
            model: "dall-e-3",
            prompt: "a lighthouse at dusk",
            n: 1,
            size: "1024x1024",
            quality: "standard",
            output_format: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("output_format"));
        assert!(json.contains("\"n\":1"));
    }

    #[test]
    fn prebuilt_image_provider_takes_precedence() {
        struct Fixed;
        #[async_trait]
        impl ImageProvider for Fixed {
            async fn generate(
                &self,
                _prompt: &str,
                _params: &GenerationParams,
            ) -> Result<ImagePayload, ProviderError> {
                Ok(ImagePayload::new(vec![1, 2, 3], None))
            }
            fn name(&self) -> &str {
                "fixed"
            }
        }
        let config = PipelineConfig::builder()
            .image_provider(Arc::new(Fixed))
            .build()
            .unwrap();
        let provider = resolve_image_provider(&config).unwrap();
        assert_eq!(provider.name(), "fixed");
    }
}
