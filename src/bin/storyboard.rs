//! CLI binary for storyboard-gen.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, writes the archive, and prints a summary.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use storyboard_gen::{
    execute_with_cancel, CancellationToken, ImageQuality, OutputFormat, PipelineConfig,
    ProgressCallback, PromptMode, RunProgressCallback, RunnerConfig, SegmentMode, StoryboardError,
};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn clip(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let head: String = msg.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        msg.to_string()
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished scene. Scenes may finish
/// out of order when `--concurrency` is above 1.
struct CliProgressCallback {
    bar: ProgressBar,
    /// First-attempt start time per scene index.
    start_times: Mutex<HashMap<usize, Instant>>,
    retries: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Segmenting text…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            retries: AtomicUsize::new(0),
        })
    }

    /// Stop the spinner when the run ends before the image stage reports.
    fn abandon(&self) {
        self.bar.finish_and_clear();
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_units: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} scenes  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_units as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Generating");
        self.bar.set_message("");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Generating {total_units} images…"))
        ));
    }

    fn on_unit_attempt(&self, index: usize, _total: usize, attempt: u32) {
        if attempt == 1 {
            if let Ok(mut m) = self.start_times.lock() {
                m.insert(index, Instant::now());
            }
        }
        self.bar.set_message(format!("scene {} (attempt {attempt})", index + 1));
    }

    fn on_unit_retry(&self, index: usize, attempt: u32, delay: Duration, error: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Scene {:>3}  attempt {} failed, retrying in {:.0}s  {}",
            yellow("↻"),
            index + 1,
            attempt,
            delay.as_secs_f64(),
            dim(&clip(error, 60)),
        ));
    }

    fn on_unit_success(&self, index: usize, total: usize, bytes: usize) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Scene {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            index + 1,
            total,
            dim(&format!("{:>7} bytes", bytes)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_failure(&self, index: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Scene {:>3}/{:<3}  {}  {}",
            red("✗"),
            index + 1,
            total,
            red(&clip(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_units: usize, success_count: usize) {
        let failed = total_units.saturating_sub(success_count);
        self.bar.finish_and_clear();
        let retries = self.retries.load(Ordering::SeqCst);
        let retry_note = if retries > 0 {
            dim(&format!("  ({retries} retries)"))
        } else {
            String::new()
        };

        if failed == 0 {
            eprintln!(
                "{} {} images generated{}",
                green("✔"),
                bold(&success_count.to_string()),
                retry_note
            );
        } else {
            eprintln!(
                "{} {}/{} images generated  ({} missing){}",
                if success_count == 0 { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_units,
                red(&failed.to_string()),
                retry_note
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One image per paragraph, prompts written by the text model
  storyboard story.txt -o story.zip

  # Read from stdin, use paragraphs as prompts verbatim
  cat notes.txt | storyboard - --prompt-mode identity

  # Let the text model pick the scenes too
  storyboard --segment-mode delegated chapter.txt

  # Free-tier pacing: one request every two minutes, long back-off
  storyboard --preset throttled story.txt

  # Generous limits: four at a time, give up after ten minutes
  storyboard --preset fan-out --concurrency 4 --batch-timeout 600 story.txt

  # Machine-readable per-scene report on stdout
  storyboard --json story.txt > report.json

RUNNER PRESETS:
  Preset      Spacing  Concurrency  Back-off     Cooldown  Warm-up
  ─────────   ───────  ───────────  ───────────  ────────  ───────
  default     1s       1            2s → 60s     10s       0
  throttled   120s     1            60s → 300s   180s      120s
  fan-out     0        4            0.5s → 8s    2s        0
  Individual flags (--min-interval, --max-retries, …) override the preset.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI key (image generation; text if no other provider)
  OPENAI_BASE_URL         OpenAI-compatible endpoint for image generation
  ANTHROPIC_API_KEY       Anthropic key (text only)
  GEMINI_API_KEY          Google Gemini key (text only)
  EDGEQUAKE_LLM_PROVIDER  Override text provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override text model ID
  RUST_LOG                Override log filter (e.g. storyboard_gen=debug)
"#;

/// Turn text into a zip of generated images, one per scene.
#[derive(Parser, Debug)]
#[command(
    name = "storyboard",
    version,
    about = "Turn text into a zip of generated images, one per scene",
    long_about = "Split text into scenes, write one image prompt per scene with a text model, \
generate the images under a provider rate limit with retry and back-off, and package every \
image that succeeded into a zip archive.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input text file, or "-" for stdin.
    input: String,

    /// Write the archive to this path.
    #[arg(short, long, env = "STORYBOARD_OUTPUT", default_value = "storyboard.zip")]
    output: PathBuf,

    /// Runner profile to start from.
    #[arg(long, env = "STORYBOARD_PRESET", value_enum, default_value = "default")]
    preset: PresetArg,

    /// Minimum spacing between image submissions, in milliseconds.
    #[arg(long, env = "STORYBOARD_MIN_INTERVAL_MS")]
    min_interval: Option<u64>,

    /// Retries per scene after the first attempt.
    #[arg(long, env = "STORYBOARD_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// First back-off delay in milliseconds; doubles per retry.
    #[arg(long, env = "STORYBOARD_BACKOFF_BASE_MS")]
    backoff_base: Option<u64>,

    /// Upper bound on any single back-off delay, in milliseconds.
    #[arg(long, env = "STORYBOARD_BACKOFF_CAP_MS")]
    backoff_cap: Option<u64>,

    /// Scenes processed at once (each still passes the pacing gate).
    #[arg(short, long, env = "STORYBOARD_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Batch-wide hold after a throttling response, in milliseconds.
    #[arg(long, env = "STORYBOARD_THROTTLE_COOLDOWN_MS")]
    throttle_cooldown: Option<u64>,

    /// Hold before the first submission, in milliseconds.
    #[arg(long, env = "STORYBOARD_WARMUP_MS")]
    warmup: Option<u64>,

    /// Cancel the run after this many seconds; finished scenes are kept.
    #[arg(long, env = "STORYBOARD_BATCH_TIMEOUT")]
    batch_timeout: Option<u64>,

    /// How to split the text into scenes.
    #[arg(long, env = "STORYBOARD_SEGMENT_MODE", value_enum, default_value = "structural")]
    segment_mode: SegmentModeArg,

    /// How to turn each scene into an image prompt.
    #[arg(long, env = "STORYBOARD_PROMPT_MODE", value_enum, default_value = "delegated")]
    prompt_mode: PromptModeArg,

    /// Text provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "STORYBOARD_PROVIDER")]
    provider: Option<String>,

    /// Text model ID for segmentation and prompt writing.
    #[arg(long, env = "STORYBOARD_TEXT_MODEL")]
    text_model: Option<String>,

    /// Image model ID.
    #[arg(long, env = "STORYBOARD_IMAGE_MODEL", default_value = "dall-e-3")]
    image_model: String,

    /// Image size as WIDTHxHEIGHT.
    #[arg(long, env = "STORYBOARD_IMAGE_SIZE", default_value = "1024x1024")]
    size: String,

    /// Image quality.
    #[arg(long, env = "STORYBOARD_QUALITY", value_enum, default_value = "standard")]
    quality: QualityArg,

    /// Ask the provider for a specific image encoding.
    #[arg(long, env = "STORYBOARD_IMAGE_FORMAT", value_enum)]
    image_format: Option<FormatArg>,

    /// Path to a text file with a custom segmentation system prompt.
    #[arg(long, env = "STORYBOARD_SEGMENT_PROMPT")]
    segment_prompt: Option<PathBuf>,

    /// Path to a text file with a custom prompt-writing system prompt.
    #[arg(long, env = "STORYBOARD_DERIVE_PROMPT")]
    derive_prompt: Option<PathBuf>,

    /// Text model temperature (0.0–2.0).
    #[arg(long, env = "STORYBOARD_TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    /// Max text model output tokens per call.
    #[arg(long, env = "STORYBOARD_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Per text-model call timeout in seconds.
    #[arg(long, env = "STORYBOARD_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Per image request timeout in seconds.
    #[arg(long, env = "STORYBOARD_IMAGE_TIMEOUT", default_value_t = 120)]
    image_timeout: u64,

    /// Leave manifest.json out of the archive.
    #[arg(long, env = "STORYBOARD_NO_MANIFEST")]
    no_manifest: bool,

    /// Print the per-scene report as JSON on stdout.
    #[arg(long, env = "STORYBOARD_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "STORYBOARD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "STORYBOARD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "STORYBOARD_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PresetArg {
    Default,
    Throttled,
    FanOut,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SegmentModeArg {
    Structural,
    Delegated,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PromptModeArg {
    Identity,
    Delegated,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    Standard,
    Hd,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Png,
    Jpeg,
    Webp,
}

impl From<SegmentModeArg> for SegmentMode {
    fn from(v: SegmentModeArg) -> Self {
        match v {
            SegmentModeArg::Structural => SegmentMode::Structural,
            SegmentModeArg::Delegated => SegmentMode::Delegated,
        }
    }
}

impl From<PromptModeArg> for PromptMode {
    fn from(v: PromptModeArg) -> Self {
        match v {
            PromptModeArg::Identity => PromptMode::Identity,
            PromptModeArg::Delegated => PromptMode::Delegated,
        }
    }
}

impl From<QualityArg> for ImageQuality {
    fn from(v: QualityArg) -> Self {
        match v {
            QualityArg::Standard => ImageQuality::Standard,
            QualityArg::Hd => ImageQuality::Hd,
        }
    }
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Png => OutputFormat::Png,
            FormatArg::Jpeg => OutputFormat::Jpeg,
            FormatArg::Webp => OutputFormat::Webp,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose asks for them.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let text = read_input(&cli.input).await?;

    let progress = show_progress.then(CliProgressCallback::new);
    let progress_cb: Option<ProgressCallback> = progress
        .clone()
        .map(|p| p as Arc<dyn RunProgressCallback>);
    let config = match build_config(&cli, progress_cb).await {
        Ok(config) => config,
        Err(e) => {
            if let Some(p) = &progress {
                p.abandon();
            }
            return Err(e);
        }
    };

    // Ctrl-C stops new submissions; finished scenes are still archived.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Interrupted, finishing in-flight scenes…", yellow("⚠"));
                cancel.cancel();
            }
        });
    }

    let result = match execute_with_cancel(&text, &config, cancel).await {
        Ok(result) => result,
        Err(e) => {
            // Segmentation and derivation failures never reach `on_run_complete`.
            if let Some(p) = &progress {
                p.abandon();
            }
            return Err(report_failure(e, cli.json));
        }
    };

    // ── Write archive ────────────────────────────────────────────────────
    if let Some(parent) = cli.output.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let tmp_path = cli.output.with_extension("zip.tmp");
    tokio::fs::write(&tmp_path, &result.archive)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, &cli.output)
        .await
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;

    let stats = result.stats.clone();
    if cli.json {
        let response = result.into_response();
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("Failed to serialise report")?
        );
    }

    if !cli.quiet {
        eprintln!(
            "{}  {}/{} scenes  {} attempts  {}ms  →  {}",
            if stats.failure_count == 0 && stats.skipped_count == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            stats.success_count,
            stats.total_units,
            stats.total_attempts,
            stats.total_duration_ms,
            bold(&cli.output.display().to_string()),
        );
        if stats.throttle_events > 0 {
            eprintln!(
                "   {}",
                dim(&format!("{} throttling responses", stats.throttle_events))
            );
        }
        if stats.skipped_count > 0 {
            eprintln!(
                "   {}",
                yellow(&format!("{} scenes skipped (run cancelled)", stats.skipped_count))
            );
        }
    }

    Ok(())
}

/// Print the structured error body in `--json` mode and turn the error into
/// the process failure.
fn report_failure(e: StoryboardError, json: bool) -> anyhow::Error {
    if json {
        if let Ok(body) = serde_json::to_string_pretty(&e.to_body()) {
            println!("{body}");
        }
    }
    anyhow::Error::new(e).context("Storyboard generation failed")
}

async fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        tokio::task::spawn_blocking(move || io::stdin().read_to_string(&mut buf).map(|_| buf))
            .await
            .context("stdin reader panicked")?
            .context("Failed to read stdin")
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read input from {input:?}"))
    }
}

async fn read_prompt_file(path: &Option<PathBuf>) -> Result<Option<String>> {
    match path {
        Some(p) => Ok(Some(
            tokio::fs::read_to_string(p)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", p))?,
        )),
        None => Ok(None),
    }
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut runner = match cli.preset {
        PresetArg::Default => RunnerConfig::default(),
        PresetArg::Throttled => RunnerConfig::throttled(),
        PresetArg::FanOut => RunnerConfig::fan_out(cli.concurrency.unwrap_or(4)),
    };
    if let Some(v) = cli.min_interval {
        runner.min_interval_ms = v;
    }
    if let Some(v) = cli.max_retries {
        runner.max_retries = v;
    }
    if let Some(v) = cli.backoff_base {
        runner.backoff_base_ms = v;
    }
    if let Some(v) = cli.backoff_cap {
        runner.backoff_cap_ms = v;
    }
    if let Some(v) = cli.concurrency {
        runner.concurrency = v;
    }
    if let Some(v) = cli.throttle_cooldown {
        runner.throttle_cooldown_ms = v;
    }
    if let Some(v) = cli.warmup {
        runner.warmup_ms = v;
    }

    let mut builder = PipelineConfig::builder()
        .runner(runner)
        .segment_mode(cli.segment_mode.into())
        .prompt_mode(cli.prompt_mode.into())
        .image_model(&cli.image_model)
        .image_size(&cli.size)
        .image_quality(cli.quality.into())
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .api_timeout_secs(cli.api_timeout)
        .include_manifest(!cli.no_manifest);

    if let Some(format) = cli.image_format {
        builder = builder.output_format(format.into());
    }
    if let Some(secs) = cli.batch_timeout {
        builder = builder.batch_timeout_secs(secs);
    }
    if let Some(ref name) = cli.provider {
        builder = builder.provider_name(name);
    }
    if let Some(ref model) = cli.text_model {
        builder = builder.text_model(model);
    }
    if let Some(prompt) = read_prompt_file(&cli.segment_prompt).await? {
        builder = builder.segment_prompt(prompt);
    }
    if let Some(prompt) = read_prompt_file(&cli.derive_prompt).await? {
        builder = builder.derive_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    let mut config = builder.build().context("Invalid configuration")?;
    config.generation.request_timeout_secs = cli.image_timeout;
    Ok(config)
}
