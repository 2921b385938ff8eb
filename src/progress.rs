//! Progress-callback trait for per-unit run events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the job runner works through the batch.
//!
//! # Example
//!
//! ```rust
//! use storyboard_gen::{PipelineConfig, RunProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl RunProgressCallback for CountingCallback {
//!     fn on_unit_success(&self, index: usize, total: usize, bytes: usize) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("scene {}/{} ready ({} bytes)", index + 1, total, bytes);
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { done: AtomicUsize::new(0) });
//! let config = PipelineConfig::builder()
//!     .progress_callback(cb as Arc<dyn RunProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

/// Called by the job runner as it processes each unit.
///
/// With `concurrency > 1` methods may be called for different units in
/// interleaved order; implementations must synchronise shared state.
/// Indices are 0-based.
pub trait RunProgressCallback: Send + Sync {
    /// Called once, before the first submission.
    fn on_run_start(&self, total_units: usize) {
        let _ = total_units;
    }

    /// Called right after the pacing gate admits an attempt.
    fn on_unit_attempt(&self, index: usize, total: usize, attempt: u32) {
        let _ = (index, total, attempt);
    }

    /// Called when an attempt failed and the unit will retry after `delay`.
    fn on_unit_retry(&self, index: usize, attempt: u32, delay: Duration, error: &str) {
        let _ = (index, attempt, delay, error);
    }

    fn on_unit_success(&self, index: usize, total: usize, bytes: usize) {
        let _ = (index, total, bytes);
    }

    /// Called when a unit reaches a terminal failure.
    fn on_unit_failure(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// Called once after the runner stops, including after cancellation.
    fn on_run_complete(&self, total_units: usize, success_count: usize) {
        let _ = (total_units, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        attempts: AtomicUsize,
        retries: AtomicUsize,
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl RunProgressCallback for TrackingCallback {
        fn on_unit_attempt(&self, _index: usize, _total: usize, _attempt: u32) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unit_retry(&self, _index: usize, _attempt: u32, _delay: Duration, _error: &str) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unit_success(&self, _index: usize, _total: usize, _bytes: usize) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unit_failure(&self, _index: usize, _total: usize, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(3);
        cb.on_unit_attempt(0, 3, 1);
        cb.on_unit_retry(0, 1, Duration::from_millis(10), "throttled");
        cb.on_unit_success(0, 3, 42);
        cb.on_unit_failure(1, 3, "rejected");
        cb.on_run_complete(3, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_unit_attempt(0, 2, 1);
        tracker.on_unit_retry(0, 1, Duration::from_secs(1), "429");
        tracker.on_unit_attempt(0, 2, 2);
        tracker.on_unit_success(0, 2, 100);
        tracker.on_unit_attempt(1, 2, 1);
        tracker.on_unit_failure(1, 2, "rejected");

        assert_eq!(tracker.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.retries.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.successes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.failures.load(Ordering::SeqCst), 1);
    }
}
