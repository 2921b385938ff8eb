//! Error types for the storyboard-gen library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`StoryboardError`]: **Fatal**: the run cannot produce an archive at
//!   all (empty input, malformed upstream response, every generation
//!   failed). Returned as `Err(StoryboardError)` from the top-level
//!   `execute*` functions.
//!
//! * [`ProviderError`]: **Per request**: one submission to a provider
//!   failed. The job runner inspects it to decide whether to retry.
//!
//! * [`UnitFailure`]: **Per unit, terminal**: a work unit gave up. Stored
//!   inside [`crate::output::GenerationOutcome`] so callers can report
//!   partial success instead of losing the whole batch to one bad scene.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The upstream stage a provider error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStage {
    Segmentation,
    PromptDerivation,
    ImageGeneration,
}

impl fmt::Display for UpstreamStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpstreamStage::Segmentation => "segmentation",
            UpstreamStage::PromptDerivation => "prompt-derivation",
            UpstreamStage::ImageGeneration => "image-generation",
        })
    }
}

/// All fatal errors returned by the storyboard-gen library.
///
/// Unit-level failures use [`UnitFailure`] and are stored in
/// [`crate::output::GenerationOutcome`] rather than propagated here.
#[derive(Debug, Error)]
pub enum StoryboardError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The input text produced zero work units.
    #[error("Input text contains no scenes.\nSeparate scenes with a blank line.")]
    EmptyInput,

    // ── Upstream errors ───────────────────────────────────────────────────
    /// A provider answered, but not with the structure we asked for.
    #[error("Malformed {stage} response: {detail}")]
    UpstreamFormat { stage: UpstreamStage, detail: String },

    /// A provider could not be reached or failed at the transport level.
    #[error("The {stage} provider is unavailable: {detail}")]
    UpstreamUnavailable { stage: UpstreamStage, detail: String },

    /// The configured provider is not initialised (missing API key etc.).
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Batch errors ──────────────────────────────────────────────────────
    /// Every submitted unit failed; there is nothing to archive.
    #[error(
        "All {total} image generations failed ({throttled} throttled, {rejected} rejected, \
         {unavailable} unavailable, {cancelled} cancelled).\nFirst error: {}",
        first_failure(.failures)
    )]
    AllGenerationsFailed {
        total: usize,
        throttled: usize,
        rejected: usize,
        unavailable: usize,
        cancelled: usize,
        failures: Vec<(usize, UnitFailure)>,
    },

    /// The run was cancelled before any unit produced an outcome.
    #[error("Run cancelled before any image was generated ({skipped} units never submitted)")]
    Cancelled { skipped: usize },

    // ── Archive errors ────────────────────────────────────────────────────
    /// The assembler was asked to finish with zero successful members.
    #[error("Refusing to build an empty archive: no successful generations")]
    EmptyArchive,

    /// The zip writer failed.
    #[error("Failed to assemble archive: {0}")]
    Archive(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output archive file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn first_failure(failures: &[(usize, UnitFailure)]) -> String {
    failures
        .first()
        .map(|(index, failure)| format!("scene {}: {}", index + 1, failure))
        .unwrap_or_else(|| "none recorded".to_string())
}

/// Machine-readable error kind for caller-facing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmptyInput,
    UpstreamFormatError,
    UpstreamUnavailable,
    ProviderNotConfigured,
    AllGenerationsFailed,
    Cancelled,
    EmptyArchive,
    ArchiveFailed,
    OutputWriteFailed,
    InvalidConfig,
    Internal,
}

impl StoryboardError {
    /// The machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoryboardError::EmptyInput => ErrorKind::EmptyInput,
            StoryboardError::UpstreamFormat { .. } => ErrorKind::UpstreamFormatError,
            StoryboardError::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            StoryboardError::ProviderNotConfigured { .. } => ErrorKind::ProviderNotConfigured,
            StoryboardError::AllGenerationsFailed { .. } => ErrorKind::AllGenerationsFailed,
            StoryboardError::Cancelled { .. } => ErrorKind::Cancelled,
            StoryboardError::EmptyArchive => ErrorKind::EmptyArchive,
            StoryboardError::Archive(_) => ErrorKind::ArchiveFailed,
            StoryboardError::OutputWriteFailed { .. } => ErrorKind::OutputWriteFailed,
            StoryboardError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            StoryboardError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-equivalent status for this error.
    ///
    /// A batch where every failure was a throttle maps to 429 so the caller
    /// knows that waiting, not rewording, is the fix.
    pub fn status_code(&self) -> u16 {
        match self {
            StoryboardError::EmptyInput | StoryboardError::InvalidConfig(_) => 400,
            StoryboardError::AllGenerationsFailed {
                total,
                throttled,
                rejected,
                unavailable,
                ..
            } => {
                if *total > 0 && throttled == total {
                    429
                } else if *total > 0 && rejected == total {
                    422
                } else if *total > 0 && unavailable == total {
                    502
                } else {
                    500
                }
            }
            StoryboardError::UpstreamUnavailable { .. } => 502,
            StoryboardError::Cancelled { .. } => 504,
            _ => 500,
        }
    }

    /// Structured body for a failed request.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            status: self.status_code(),
            message: self.to_string(),
        }
    }
}

/// Serialisable error returned to a caller when the request fails as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

/// A single failed provider request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    /// HTTP 429 or equivalent: the aggregate request rate is too high.
    #[error("provider throttled the request{}", retry_after_hint(.retry_after_ms))]
    Throttled { retry_after_ms: Option<u64> },

    /// The provider refused this request (bad prompt, content policy, auth).
    /// Retrying the same request will not help.
    #[error("provider rejected the request{}: {detail}", status_hint(.status))]
    Rejected { status: Option<u16>, detail: String },

    /// Transport failure, timeout, or 5xx.
    #[error("provider unavailable: {detail}")]
    Unavailable { detail: String },
}

fn retry_after_hint(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!(" (retry after {ms}ms)"),
        None => String::new(),
    }
}

fn status_hint(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl ProviderError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected { .. })
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, ProviderError::Throttled { .. })
    }
}

/// Coarse cause of a unit failure, used for batch-level summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Throttled,
    Rejected,
    Unavailable,
    Cancelled,
}

/// Why a work unit ended without an image.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitFailure {
    /// Every allowed attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: ProviderError,
    },

    /// The provider rejected the request; no further attempts were made.
    #[error("rejected on attempt {attempts}: {error}")]
    Rejected { attempts: u32, error: ProviderError },

    /// The run was cancelled between attempts.
    #[error("cancelled after {attempts} attempts{}", last_error_hint(.last_error))]
    Cancelled {
        attempts: u32,
        last_error: Option<ProviderError>,
    },
}

fn last_error_hint(last_error: &Option<ProviderError>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

impl UnitFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            UnitFailure::RetriesExhausted { attempts, .. }
            | UnitFailure::Rejected { attempts, .. }
            | UnitFailure::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn cause(&self) -> FailureCause {
        match self {
            UnitFailure::RetriesExhausted { last_error, .. } => match last_error {
                ProviderError::Throttled { .. } => FailureCause::Throttled,
                ProviderError::Rejected { .. } => FailureCause::Rejected,
                ProviderError::Unavailable { .. } => FailureCause::Unavailable,
            },
            UnitFailure::Rejected { .. } => FailureCause::Rejected,
            UnitFailure::Cancelled { .. } => FailureCause::Cancelled,
        }
    }
}

impl StoryboardError {
    /// Build [`StoryboardError::AllGenerationsFailed`] from per-unit failures,
    /// keeping every individual reason.
    pub fn all_failed(failures: Vec<(usize, UnitFailure)>) -> Self {
        let count = |cause: FailureCause| failures.iter().filter(|(_, f)| f.cause() == cause).count();
        StoryboardError::AllGenerationsFailed {
            total: failures.len(),
            throttled: count(FailureCause::Throttled),
            rejected: count(FailureCause::Rejected),
            unavailable: count(FailureCause::Unavailable),
            cancelled: count(FailureCause::Cancelled),
            failures,
        }
    }
}
