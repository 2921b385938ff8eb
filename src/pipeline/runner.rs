//! Rate-limited job runner: one image generation per work unit.
//!
//! ## Algorithm per unit
//!
//! 1. Pass the shared pacing gate ([`RunState::admit`]).
//! 2. Submit the prompt.
//! 3. On a retryable failure, back off `min(cap, base * 2^(attempt-1))`
//!    (stretched to any server `Retry-After`, still capped) and go to 1.
//!    A throttle also places a batch-wide cooldown on the gate. A rejection
//!    ends the unit immediately without spending retry budget.
//! 4. Emit exactly one [`GenerationOutcome`]; a failed unit never stops the
//!    batch.
//!
//! ## Concurrency
//!
//! Workers pull units in index order through `buffer_unordered`. With
//! `concurrency = 1` that is a plain sequential loop; with more, units
//! overlap their back-off waits and provider latency, but every submission
//! still goes through the one gate. Outcomes are re-sorted by `unit_index`
//! before they are returned.
//!
//! ## Cancellation
//!
//! When the token fires, no new attempt or retry starts. In-flight
//! submissions finish and are recorded. Units that never got an attempt
//! produce no outcome and are counted as skipped.

use crate::config::{GenerationParams, RunnerConfig};
use crate::error::{ProviderError, UnitFailure};
use crate::output::{GenerationOutcome, ImagePayload, OutcomeStatus, WorkUnit};
use crate::pipeline::gate::RunState;
use crate::progress::ProgressCallback;
use crate::provider::ImageProvider;
use futures::stream::{self, StreamExt};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the runner produced for one batch.
#[derive(Debug, Clone)]
pub struct RunnerOutput {
    /// One outcome per submitted unit, ordered by `unit_index`.
    pub outcomes: Vec<GenerationOutcome>,
    /// Units never submitted because the run was cancelled.
    pub skipped: usize,
    pub throttle_events: u32,
    pub total_attempts: u32,
    pub cancelled: bool,
}

/// Drives image generation for a batch under one [`RunState`].
pub struct JobRunner<'a> {
    provider: &'a dyn ImageProvider,
    config: &'a RunnerConfig,
    params: &'a GenerationParams,
    state: RunState,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl<'a> JobRunner<'a> {
    pub fn new(
        provider: &'a dyn ImageProvider,
        config: &'a RunnerConfig,
        params: &'a GenerationParams,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            config,
            params,
            state: RunState::new(config),
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Run every unit and return outcomes ordered by `unit_index`.
    pub async fn run(&self, units: &[WorkUnit]) -> RunnerOutput {
        self.run_with(units, |_| {}).await
    }

    /// Run every unit, handing each outcome to `on_outcome` in completion
    /// order as soon as it is final.
    pub async fn run_with<F>(&self, units: &[WorkUnit], mut on_outcome: F) -> RunnerOutput
    where
        F: FnMut(&GenerationOutcome),
    {
        let total = units.len();
        let concurrency = self.config.concurrency.max(1);
        info!(
            "Generating {} images via {} (concurrency {}, spacing {}ms, {} retries)",
            total,
            self.provider.name(),
            concurrency,
            self.config.min_interval_ms,
            self.config.max_retries
        );
        if let Some(ref cb) = self.progress {
            cb.on_run_start(total);
        }

        let mut outcomes = Vec::with_capacity(total);
        let mut skipped = 0usize;
        let mut results = stream::iter(units.iter().map(|unit| self.process_unit(unit, total)))
            .buffer_unordered(concurrency);

        while let Some(result) = results.next().await {
            match result {
                Some(outcome) => {
                    on_outcome(&outcome);
                    outcomes.push(outcome);
                }
                None => skipped += 1,
            }
        }
        drop(results);

        outcomes.sort_by_key(|o| o.unit_index);
        let success = outcomes.iter().filter(|o| o.is_success()).count();
        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!(
                "Run cancelled: {} finalized, {} never submitted",
                outcomes.len(),
                skipped
            );
        }
        info!("Generation finished: {}/{} succeeded", success, total);
        if let Some(ref cb) = self.progress {
            cb.on_run_complete(total, success);
        }

        RunnerOutput {
            total_attempts: outcomes.iter().map(|o| o.attempts_used).sum(),
            outcomes,
            skipped,
            throttle_events: self.state.throttle_events(),
            cancelled,
        }
    }

    /// Process one unit to a terminal outcome, or `None` if cancellation
    /// arrived before its first attempt.
    async fn process_unit(&self, unit: &WorkUnit, total: usize) -> Option<GenerationOutcome> {
        let start = Instant::now();
        let scene = unit.index + 1;
        let mut attempts: u32 = 0;
        let mut last_error: Option<ProviderError> = None;

        loop {
            if self.state.admit(&self.cancel).await.is_none() {
                if attempts == 0 {
                    debug!("Scene {}: skipped, run cancelled", scene);
                    return None;
                }
                return Some(self.finish(
                    unit,
                    total,
                    attempts,
                    start,
                    Err(UnitFailure::Cancelled {
                        attempts,
                        last_error,
                    }),
                ));
            }

            attempts += 1;
            if let Some(ref cb) = self.progress {
                cb.on_unit_attempt(unit.index, total, attempts);
            }
            debug!("Scene {}/{}: attempt {}", scene, total, attempts);

            let err = match self.provider.generate(&unit.prompt, self.params).await {
                Ok(payload) => {
                    return Some(self.finish(unit, total, attempts, start, Ok(payload)));
                }
                Err(e) => e,
            };

            if err.is_throttle() {
                self.state.record_throttle().await;
            }

            if !err.is_retryable() {
                warn!("Scene {}: rejected, not retrying: {}", scene, err);
                return Some(self.finish(
                    unit,
                    total,
                    attempts,
                    start,
                    Err(UnitFailure::Rejected {
                        attempts,
                        error: err,
                    }),
                ));
            }

            if attempts > self.config.max_retries {
                warn!("Scene {}: giving up after {} attempts: {}", scene, attempts, err);
                return Some(self.finish(
                    unit,
                    total,
                    attempts,
                    start,
                    Err(UnitFailure::RetriesExhausted {
                        attempts,
                        last_error: err,
                    }),
                ));
            }

            let retry_after = match err {
                ProviderError::Throttled { retry_after_ms } => retry_after_ms,
                _ => None,
            };
            let delay = self.config.retry_delay(attempts, retry_after);
            warn!(
                "Scene {}: attempt {} failed: {}; retry {}/{} in {}ms",
                scene,
                attempts,
                err,
                attempts,
                self.config.max_retries,
                delay.as_millis()
            );
            if let Some(ref cb) = self.progress {
                cb.on_unit_retry(unit.index, attempts, delay, &err.to_string());
            }
            last_error = Some(err);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return Some(self.finish(
                        unit,
                        total,
                        attempts,
                        start,
                        Err(UnitFailure::Cancelled { attempts, last_error }),
                    ));
                }
            }
        }
    }

    fn finish(
        &self,
        unit: &WorkUnit,
        total: usize,
        attempts: u32,
        start: Instant,
        result: Result<ImagePayload, UnitFailure>,
    ) -> GenerationOutcome {
        let status = match result {
            Ok(payload) => {
                debug!("Scene {}: {} bytes after {} attempts", unit.index + 1, payload.len(), attempts);
                if let Some(ref cb) = self.progress {
                    cb.on_unit_success(unit.index, total, payload.len());
                }
                OutcomeStatus::Success(payload)
            }
            Err(failure) => {
                if let Some(ref cb) = self.progress {
                    cb.on_unit_failure(unit.index, total, &failure.to_string());
                }
                OutcomeStatus::Failed(failure)
            }
        };
        GenerationOutcome {
            unit_index: unit.index,
            attempts_used: attempts,
            status,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies from a fixed script, then succeeds.
    struct Scripted {
        script: Mutex<Vec<ProviderError>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(mut errors: Vec<ProviderError>) -> Self {
            errors.reverse();
            Self {
                script: Mutex::new(errors),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ImageProvider for Scripted {
        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<ImagePayload, ProviderError> {
            self.calls.lock().unwrap().push(Instant::now());
            match self.script.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(ImagePayload::new(b"\x89PNG\r\n\x1a\n".to_vec(), None)),
            }
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn unit() -> WorkUnit {
        WorkUnit {
            index: 0,
            source_text: "A ship in fog".into(),
            prompt: "A ship in fog, wide shot".into(),
        }
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            min_interval_ms: 0,
            max_retries: 2,
            backoff_base_ms: 100,
            backoff_cap_ms: 1_000,
            concurrency: 1,
            throttle_cooldown_ms: 0,
            warmup_ms: 0,
        }
    }

    fn unavailable() -> ProviderError {
        ProviderError::Unavailable {
            detail: "503".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_then_succeed() {
        let provider = Scripted::new(vec![unavailable(), unavailable()]);
        let (config, params) = (config(), GenerationParams::default());
        let runner = JobRunner::new(&provider, &config, &params, CancellationToken::new());
        let out = runner.run(&[unit()]).await;

        assert_eq!(out.outcomes[0].attempts_used, 3);
        assert!(out.outcomes[0].is_success());
        let calls = provider.calls.lock().unwrap().clone();
        assert_eq!(calls[1] - calls[0], Duration::from_millis(100));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_does_not_spend_retry_budget() {
        let provider = Scripted::new(vec![ProviderError::Rejected {
            status: Some(400),
            detail: "policy".into(),
        }]);
        let (config, params) = (config(), GenerationParams::default());
        let runner = JobRunner::new(&provider, &config, &params, CancellationToken::new());
        let out = runner.run(&[unit()]).await;

        assert_eq!(out.outcomes[0].attempts_used, 1);
        assert!(matches!(
            out.outcomes[0].failure(),
            Some(UnitFailure::Rejected { attempts: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_caps_attempts() {
        let provider = Scripted::new(vec![unavailable(); 10]);
        let (config, params) = (config(), GenerationParams::default());
        let runner = JobRunner::new(&provider, &config, &params, CancellationToken::new());
        let out = runner.run(&[unit()]).await;

        assert_eq!(out.outcomes[0].attempts_used, config.max_retries + 1);
        assert!(matches!(
            out.outcomes[0].failure(),
            Some(UnitFailure::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(out.total_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_run_skips_everything() {
        let provider = Scripted::new(vec![]);
        let (config, params) = (config(), GenerationParams::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = JobRunner::new(&provider, &config, &params, cancel);
        let out = runner.run(&[unit()]).await;

        assert!(out.outcomes.is_empty());
        assert_eq!(out.skipped, 1);
        assert!(out.cancelled);
        assert!(provider.calls.lock().unwrap().is_empty());
    }
}
