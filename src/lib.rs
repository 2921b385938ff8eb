//! # storyboard-gen
//!
//! Turn a block of text into a zip archive of illustrations, one image per
//! scene.
//!
//! ## Pipeline Overview
//!
//! ```text
//! text
//!  │
//!  ├─ 1. Segment  blank-line split, or ask a text model for scenes
//!  ├─ 2. Derive   one batched text-model call → one image prompt per scene
//!  ├─ 3. Generate paced, retried image requests (shared pacing gate)
//!  └─ 4. Archive  scene-N.<ext> members in scene order (+ manifest.json)
//! ```
//!
//! Image providers rate-limit aggressively. The job runner keeps a minimum
//! spacing between any two submissions, backs off exponentially on failure,
//! and holds the whole batch after a throttling response. One failed scene
//! never fails the batch: the archive holds whatever succeeded and the
//! per-unit reports say what happened to the rest.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use storyboard_gen::{execute, PipelineConfig, RunnerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Text provider auto-detected; images via OPENAI_API_KEY
//!     let config = PipelineConfig::builder()
//!         .runner(RunnerConfig::fan_out(4))
//!         .build()?;
//!     let text = std::fs::read_to_string("story.txt")?;
//!     let result = execute(&text, &config).await?;
//!     std::fs::write("storyboard.zip", &result.archive)?;
//!     eprintln!("{}/{} scenes", result.success_count(), result.stats.total_units);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `storyboard` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! storyboard-gen = { version = "0.1", default-features = false }
//! ```
//!
//! ## Runner Profiles
//!
//! | Profile | Spacing | Concurrency | Back-off | Use when |
//! |---------|---------|-------------|----------|----------|
//! | `RunnerConfig::default()` | 1 s | 1 | 2 s → 60 s | Typical paid tier |
//! | `RunnerConfig::throttled()` | 120 s | 1 | 60 s → 300 s | Free or heavily limited tier |
//! | `RunnerConfig::fan_out(n)` | none | n | 0.5 s → 8 s | Generous limits, want speed |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod execute;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod provider;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    GenerationParams, ImageQuality, OutputFormat, PipelineConfig, PipelineConfigBuilder, PromptMode,
    RunnerConfig, SegmentMode,
};
pub use error::{ErrorBody, ErrorKind, ProviderError, StoryboardError, UnitFailure, UpstreamStage};
pub use execute::{execute, execute_sync, execute_to_file, execute_with_cancel};
pub use output::{
    ArchiveResponse, GenerationOutcome, ImagePayload, OutcomeStatus, PipelineResult, RunStats,
    UnitReport, UnitStatus, WorkUnit,
};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use provider::{ImageProvider, LlmTextProvider, OpenAiImageProvider, TextProvider};
pub use tokio_util::sync::CancellationToken;
