//! Orchestrator entry points: text in, zip archive out.
//!
//! ```text
//! text ──▶ segment ──▶ derive ──▶ runner ──▶ archive
//! ```
//!
//! Every entry point returns `Ok` for full and partial success alike; check
//! [`PipelineResult::is_partial`] or the per-unit reports. `Err` means no
//! archive could be produced.

use crate::config::PipelineConfig;
use crate::error::StoryboardError;
use crate::output::{unit_reports, PipelineResult, RunStats, UnitReport};
use crate::pipeline::archive::ArchiveAssembler;
use crate::pipeline::derive::derive_prompts;
use crate::pipeline::runner::JobRunner;
use crate::pipeline::segment::segment;
use crate::provider::{resolve_image_provider, resolve_text_provider};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Contents of the trailing `manifest.json` member.
#[derive(Debug, Serialize)]
struct Manifest<'a> {
    total_units: usize,
    success_count: usize,
    failure_count: usize,
    skipped_count: usize,
    units: &'a [UnitReport],
}

/// Turn `text` into a storyboard archive.
///
/// # Errors
/// Returns `Err(StoryboardError)` only when no archive can be produced:
/// - blank input or zero scenes
/// - a malformed or unreachable text-provider response
/// - every image generation failed, or the run was cancelled before any
///   unit finished
pub async fn execute(text: &str, config: &PipelineConfig) -> Result<PipelineResult, StoryboardError> {
    execute_with_cancel(text, config, CancellationToken::new()).await
}

/// Like [`execute`], but stops starting new submissions once `cancel` fires.
///
/// Units already in flight finish and are archived; units never submitted
/// are reported as skipped. `config.batch_timeout_secs`, when set, cancels
/// the run through a child of `cancel` so the caller's token is never
/// triggered by the library.
pub async fn execute_with_cancel(
    text: &str,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> Result<PipelineResult, StoryboardError> {
    let total_start = Instant::now();
    info!("Starting storyboard run ({} chars of input)", text.len());

    if text.trim().is_empty() {
        return Err(StoryboardError::EmptyInput);
    }

    let run_cancel = cancel.child_token();
    let budget = config.batch_timeout_secs.map(|secs| {
        let token = run_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!("Batch budget of {}s exhausted; cancelling run", secs);
            token.cancel();
        })
    });

    let result = run_stages(text, config, &run_cancel, total_start).await;

    if let Some(handle) = budget {
        handle.abort();
    }
    result
}

async fn run_stages(
    text: &str,
    config: &PipelineConfig,
    cancel: &CancellationToken,
    total_start: Instant,
) -> Result<PipelineResult, StoryboardError> {
    // ── Step 1: Segment + derive prompts ─────────────────────────────────
    let text_start = Instant::now();
    let text_provider = if config.needs_text_provider() {
        Some(resolve_text_provider(config)?)
    } else {
        None
    };
    let seeds = segment(text, config, text_provider.as_deref()).await?;
    let units = derive_prompts(seeds, config, text_provider.as_deref()).await?;
    let segment_duration_ms = text_start.elapsed().as_millis() as u64;
    debug!("Text stages finished in {}ms", segment_duration_ms);

    // ── Step 2: Generate images, archiving as outcomes arrive ────────────
    let image_provider = resolve_image_provider(config)?;
    let runner = JobRunner::new(
        image_provider.as_ref(),
        &config.runner,
        &config.generation,
        cancel.clone(),
    )
    .with_progress(config.progress_callback.clone());

    let generation_start = Instant::now();
    let mut assembler = ArchiveAssembler::new();
    let mut archive_error: Option<StoryboardError> = None;
    let run = runner
        .run_with(&units, |outcome| {
            if archive_error.is_none() {
                if let Err(e) = assembler.push(outcome.clone()) {
                    archive_error = Some(e);
                }
            }
        })
        .await;
    let generation_duration_ms = generation_start.elapsed().as_millis() as u64;
    if let Some(e) = archive_error {
        return Err(e);
    }

    // ── Step 3: Decide ───────────────────────────────────────────────────
    let success_count = run.outcomes.iter().filter(|o| o.is_success()).count();
    if success_count == 0 {
        if run.outcomes.is_empty() {
            return Err(StoryboardError::Cancelled {
                skipped: run.skipped,
            });
        }
        let failures = run
            .outcomes
            .iter()
            .filter_map(|o| o.failure().map(|f| (o.unit_index, f.clone())))
            .collect();
        return Err(StoryboardError::all_failed(failures));
    }
    let failure_count = run.outcomes.len() - success_count;

    // ── Step 4: Finish archive ───────────────────────────────────────────
    let archive_start = Instant::now();
    let manifest = if config.include_manifest {
        let reports = unit_reports(&units, &run.outcomes);
        let body = Manifest {
            total_units: units.len(),
            success_count,
            failure_count,
            skipped_count: run.skipped,
            units: &reports,
        };
        Some(
            serde_json::to_vec_pretty(&body)
                .map_err(|e| StoryboardError::Internal(format!("manifest: {e}")))?,
        )
    } else {
        None
    };
    let archive = assembler.finish(manifest)?;
    let archive_duration_ms = archive_start.elapsed().as_millis() as u64;

    let stats = RunStats {
        total_units: units.len(),
        success_count,
        failure_count,
        skipped_count: run.skipped,
        total_attempts: run.total_attempts,
        throttle_events: run.throttle_events,
        cancelled: run.cancelled,
        segment_duration_ms,
        generation_duration_ms,
        archive_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    if failure_count > 0 || run.skipped > 0 {
        warn!(
            "Partial storyboard: {} of {} scenes archived ({} failed, {} skipped)",
            success_count,
            units.len(),
            failure_count,
            run.skipped
        );
    }
    info!(
        "Storyboard complete: {}/{} scenes, {} bytes, {}ms total",
        success_count,
        units.len(),
        archive.len(),
        stats.total_duration_ms
    );

    Ok(PipelineResult {
        units,
        outcomes: run.outcomes,
        archive,
        stats,
    })
}

/// Run the pipeline and write the archive to `output_path`.
///
/// Uses atomic write (temp file + rename) so a failed run never leaves a
/// truncated archive behind.
pub async fn execute_to_file(
    text: &str,
    output_path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RunStats, StoryboardError> {
    let result = execute(text, config).await?;
    let path = output_path.as_ref();
    let write_err = |source: std::io::Error| StoryboardError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
    }

    let tmp_path = path.with_extension("zip.tmp");
    tokio::fs::write(&tmp_path, &result.archive)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    info!("Wrote {}", path.display());
    Ok(result.stats)
}

/// Synchronous wrapper around [`execute`].
///
/// Creates a temporary tokio runtime internally; do not call from inside
/// an async context.
pub fn execute_sync(text: &str, config: &PipelineConfig) -> Result<PipelineResult, StoryboardError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| StoryboardError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(execute(text, config))
}
