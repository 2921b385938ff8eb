//! Per-run pacing state shared by every worker.
//!
//! [`RunState`] owns the only mutable resource the job runner shares across
//! workers: the time of the last submission plus any batch-wide hold
//! (warm-up or post-throttle cooldown). Workers queue on a turn lock so they
//! pass the gate strictly one at a time and no two submissions are ever closer
//! than `min_interval`. The pacing state sits under its own lock that is never
//! held across a wait: a throttle recorded while a worker is sleeping in the
//! gate wakes it, and it re-reads the deadline before submitting.
//!
//! A new `RunState` is created per run and dropped with it; nothing here is
//! global.

use crate::config::RunnerConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct GateState {
    /// When the gate last admitted a submission.
    last_request: Option<Instant>,
    /// No submission before this instant (warm-up or throttle cooldown).
    hold_until: Option<Instant>,
}

/// Process-local state for one pipeline run.
#[derive(Debug)]
pub struct RunState {
    /// Held by the worker currently waiting for admission.
    turn: Mutex<()>,
    gate: Mutex<GateState>,
    /// Signalled whenever `hold_until` moves later.
    hold_extended: Notify,
    min_interval: Duration,
    throttle_cooldown: Duration,
    throttle_events: AtomicU32,
    submissions: AtomicU32,
}

impl RunState {
    pub fn new(config: &RunnerConfig) -> Self {
        let warmup = config.warmup();
        let hold_until = if warmup.is_zero() {
            None
        } else {
            info!("Holding first submission for {}ms warm-up", warmup.as_millis());
            Some(Instant::now() + warmup)
        };
        Self {
            turn: Mutex::new(()),
            gate: Mutex::new(GateState {
                last_request: None,
                hold_until,
            }),
            hold_extended: Notify::new(),
            min_interval: config.min_interval(),
            throttle_cooldown: config.throttle_cooldown(),
            throttle_events: AtomicU32::new(0),
            submissions: AtomicU32::new(0),
        }
    }

    /// Wait until a submission is allowed, then record it.
    ///
    /// Returns the admitted instant, or `None` if `cancel` fired first; a
    /// cancelled wait records nothing.
    pub async fn admit(&self, cancel: &CancellationToken) -> Option<Instant> {
        if cancel.is_cancelled() {
            return None;
        }

        let _turn = tokio::select! {
            guard = self.turn.lock() => guard,
            _ = cancel.cancelled() => return None,
        };

        loop {
            // Registered before reading the state so an extension made
            // between the read and the sleep still wakes us.
            let extended = self.hold_extended.notified();
            tokio::pin!(extended);
            extended.as_mut().enable();

            let mut gate = self.gate.lock().await;
            let ready_at = self.ready_at(&gate);
            let now = Instant::now();
            if ready_at <= now {
                gate.last_request = Some(now);
                if gate.hold_until.is_some_and(|h| h <= now) {
                    gate.hold_until = None;
                }
                self.submissions.fetch_add(1, Ordering::SeqCst);
                return Some(now);
            }
            drop(gate);

            debug!(
                "Pacing gate: waiting {}ms",
                ready_at.saturating_duration_since(now).as_millis()
            );
            tokio::select! {
                _ = sleep_until(ready_at) => {}
                _ = &mut extended => debug!("Pacing gate: hold extended, re-checking"),
                _ = cancel.cancelled() => return None,
            }
        }
    }

    fn ready_at(&self, gate: &GateState) -> Instant {
        let paced = gate.last_request.map(|t| t + self.min_interval);
        match (paced, gate.hold_until) {
            (Some(p), Some(h)) => p.max(h),
            (Some(p), None) => p,
            (None, Some(h)) => h,
            (None, None) => Instant::now(),
        }
    }

    /// Record a throttling response: every worker's next submission waits
    /// out one cooldown from now. Overlapping throttles extend the same hold
    /// rather than stacking.
    pub async fn record_throttle(&self) {
        self.throttle_events.fetch_add(1, Ordering::SeqCst);
        if self.throttle_cooldown.is_zero() {
            return;
        }
        let until = Instant::now() + self.throttle_cooldown;
        let extended = {
            let mut gate = self.gate.lock().await;
            let extended = gate.hold_until.map_or(true, |h| h < until);
            if extended {
                gate.hold_until = Some(until);
            }
            extended
        };
        if extended {
            warn!(
                "Provider throttled; holding all submissions for {}ms",
                self.throttle_cooldown.as_millis()
            );
            self.hold_extended.notify_waiters();
        }
    }

    pub fn throttle_events(&self) -> u32 {
        self.throttle_events.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }
}
