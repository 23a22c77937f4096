//! Rate controller: paces permit issuance to at most `target_tps`
//! permits/second, with an optional linear ramp from 1 to `target_tps`.
//!
//! Grounded in the teacher's `run_worker`/`run_scenario_worker` loops
//! (`worker.rs`), which already schedule work against an absolute
//! `next_fire_time` via `tokio::time::sleep_until` to avoid cumulative
//! drift. This module lifts that pattern out into its own addressable
//! component per spec.md §4.1, adding the fetch-and-add slot assignment and
//! the ramp interpolation the worker loop didn't need. The controller's
//! notion of "elapsed since start" goes through the injectable [`Clock`]
//! from spec.md §2's component list (rather than calling `Instant::now()`
//! directly), so ramp-progress math is testable with a [`crate::clock::MockClock`];
//! the actual pacing wait still uses real `tokio::time`, since only wall
//! clock time can make a task genuinely wait.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Error)]
pub enum RateControllerError {
    #[error("target_tps must be > 0, got {0}")]
    InvalidTargetTps(f64),
}

/// Result of a single `acquire()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Ok,
    Interrupted,
}

/// Paces callers so that, in steady state, permits are issued at
/// `target_tps` per second. Each accepted caller is assigned a distinct,
/// monotonically increasing slot via an atomic fetch-and-add onto
/// `next_fire_time`, so concurrent callers never collide on the same slot.
///
/// Cancellation is a `CancellationToken` shared with the run that owns this
/// controller (see [`crate::runner`]) rather than one the controller keeps
/// to itself, so a single `stop()` call interrupts both the submission loop
/// and any caller currently parked in [`RateController::acquire`].
pub struct RateController {
    target_tps: f64,
    ramp_duration: Duration,
    clock: Arc<dyn Clock>,
    start_nanos: AtomicU64,
    /// Nanoseconds since `start` at which the next unclaimed slot fires.
    next_fire_time_nanos: AtomicU64,
    issued_count: AtomicU64,
    cancel: CancellationToken,
}

impl RateController {
    pub fn new(
        target_tps: f64,
        ramp_duration: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, RateControllerError> {
        Self::with_clock(target_tps, ramp_duration, cancel, Arc::new(SystemClock))
    }

    /// Same as [`RateController::new`], but with an explicit [`Clock`] —
    /// tests use this with a [`crate::clock::MockClock`] to drive ramp
    /// interpolation without real sleeps.
    pub fn with_clock(
        target_tps: f64,
        ramp_duration: Duration,
        cancel: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateControllerError> {
        if target_tps <= 0.0 {
            return Err(RateControllerError::InvalidTargetTps(target_tps));
        }
        Ok(Self {
            target_tps,
            ramp_duration,
            start_nanos: AtomicU64::new(clock.now_nanos()),
            next_fire_time_nanos: AtomicU64::new(0),
            issued_count: AtomicU64::new(0),
            cancel,
            clock,
        })
    }

    fn elapsed(&self) -> Duration {
        let now = self.clock.now_nanos();
        let start = self.start_nanos.load(Ordering::SeqCst);
        Duration::from_nanos(now.saturating_sub(start))
    }

    /// The effective target tps at `elapsed` since controller start, after
    /// ramp interpolation. Interpolation factor is clamped to [0,1].
    fn effective_tps(&self, elapsed: Duration) -> f64 {
        if self.ramp_duration.is_zero() {
            return self.target_tps;
        }
        let fraction = (elapsed.as_secs_f64() / self.ramp_duration.as_secs_f64()).clamp(0.0, 1.0);
        1.0 + (self.target_tps - 1.0) * fraction
    }

    /// Blocks until the caller's assigned slot arrives, then returns `Ok`
    /// and increments `issued_count`. Returns `Interrupted` (without
    /// incrementing the count) if cancelled while waiting.
    pub async fn acquire(&self) -> Permit {
        let elapsed = self.elapsed();
        let effective_tps = self.effective_tps(elapsed);
        let interval_nanos = (1_000_000_000.0 / effective_tps) as u64;

        let my_slot_nanos = self
            .next_fire_time_nanos
            .fetch_add(interval_nanos, Ordering::SeqCst);
        let now_nanos = elapsed.as_nanos() as u64;

        if my_slot_nanos > now_nanos {
            let wait = Duration::from_nanos(my_slot_nanos - now_nanos);
            let deadline = tokio::time::Instant::now() + wait;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.cancel.cancelled() => return Permit::Interrupted,
            }
        }

        self.issued_count.fetch_add(1, Ordering::SeqCst);
        Permit::Ok
    }

    pub fn issued_count(&self) -> u64 {
        self.issued_count.load(Ordering::SeqCst)
    }

    /// Re-seats `start` to now and zeroes `next_fire_time`/`issued_count`.
    /// Called at the warmup/main phase boundary (spec.md §4.5).
    pub fn reset(&self) {
        self.start_nanos
            .store(self.clock.now_nanos(), Ordering::SeqCst);
        self.next_fire_time_nanos.store(0, Ordering::SeqCst);
        self.issued_count.store(0, Ordering::SeqCst);
    }

    /// Interrupts any caller currently parked in `acquire()`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
