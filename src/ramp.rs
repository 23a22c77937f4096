//! Ramp strategies: pure functions from elapsed time to target concurrency.
//!
//! Grounded in the teacher's `LoadModel` (`load_models.rs`), which plays the
//! same role for target RPS. The shape carries over — an enum of named
//! variants, each a closed-form function of elapsed seconds — but the
//! variants themselves are replaced per spec.md §4.2: `Linear`, `Step`,
//! `Constant`, each monotonically non-decreasing and bounded by
//! `[starting_concurrency, max_concurrency]`.

/// Maps elapsed time since test start to a target in-flight concurrency.
#[derive(Debug, Clone)]
pub enum RampStrategy {
    /// Interpolates linearly from `start` to `max` over `ramp_seconds`, then
    /// holds at `max`.
    Linear {
        start: u32,
        max: u32,
        ramp_seconds: f64,
    },

    /// Increases by `step` every `interval_seconds`, capped at `max`.
    Step {
        start: u32,
        max: u32,
        step: u32,
        interval_seconds: f64,
    },

    /// Always `max`; no ramp.
    Constant { max: u32 },
}

impl RampStrategy {
    pub fn starting_concurrency(&self) -> u32 {
        match self {
            RampStrategy::Linear { start, .. } => *start,
            RampStrategy::Step { start, .. } => *start,
            RampStrategy::Constant { max } => *max,
        }
    }

    pub fn max_concurrency(&self) -> u32 {
        match self {
            RampStrategy::Linear { max, .. } => *max,
            RampStrategy::Step { max, .. } => *max,
            RampStrategy::Constant { max } => *max,
        }
    }

    /// The target concurrency at `elapsed_secs` seconds since test start.
    pub fn target_at(&self, elapsed_secs: f64) -> u32 {
        match self {
            RampStrategy::Linear {
                start,
                max,
                ramp_seconds,
            } => Self::linear(*start, *max, *ramp_seconds, elapsed_secs),
            RampStrategy::Step {
                start,
                max,
                step,
                interval_seconds,
            } => Self::step(*start, *max, *step, *interval_seconds, elapsed_secs),
            RampStrategy::Constant { max } => *max,
        }
    }

    fn linear(start: u32, max: u32, ramp_seconds: f64, elapsed_secs: f64) -> u32 {
        if elapsed_secs <= 0.0 || ramp_seconds <= 0.0 {
            return start;
        }
        if elapsed_secs >= ramp_seconds {
            return max;
        }
        let span = max as f64 - start as f64;
        let value = start as f64 + (span * elapsed_secs / ramp_seconds).round();
        value as u32
    }

    fn step(start: u32, max: u32, step: u32, interval_seconds: f64, elapsed_secs: f64) -> u32 {
        if elapsed_secs <= 0.0 || interval_seconds <= 0.0 {
            return start.min(max);
        }
        let steps_elapsed = (elapsed_secs / interval_seconds).floor() as u32;
        (start + steps_elapsed.saturating_mul(step)).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_is_bounded_and_monotonic() {
        let ramp = RampStrategy::Linear {
            start: 1,
            max: 100,
            ramp_seconds: 10.0,
        };
        let mut prev = ramp.target_at(0.0);
        assert_eq!(prev, 1);
        for i in 1..=20 {
            let elapsed = i as f64 * 0.5;
            let current = ramp.target_at(elapsed);
            assert!(current >= prev, "ramp must be non-decreasing");
            assert!(current >= 1 && current <= 100);
            prev = current;
        }
        assert_eq!(ramp.target_at(10.0), 100);
        assert_eq!(ramp.target_at(50.0), 100);
    }

    #[test]
    fn linear_at_or_before_zero_returns_start() {
        let ramp = RampStrategy::Linear {
            start: 5,
            max: 50,
            ramp_seconds: 10.0,
        };
        assert_eq!(ramp.target_at(0.0), 5);
        assert_eq!(ramp.target_at(-1.0), 5);
    }

    #[test]
    fn step_increments_at_boundaries() {
        let ramp = RampStrategy::Step {
            start: 1,
            max: 10,
            step: 2,
            interval_seconds: 1.0,
        };
        assert_eq!(ramp.target_at(0.0), 1);
        assert_eq!(ramp.target_at(0.99), 1);
        assert_eq!(ramp.target_at(1.0), 3);
        assert_eq!(ramp.target_at(2.5), 5);
        assert_eq!(ramp.target_at(100.0), 10);
    }

    #[test]
    fn constant_always_returns_max() {
        let ramp = RampStrategy::Constant { max: 42 };
        assert_eq!(ramp.target_at(0.0), 42);
        assert_eq!(ramp.target_at(9999.0), 42);
    }

    #[test]
    fn step_is_monotonic() {
        let ramp = RampStrategy::Step {
            start: 0,
            max: 20,
            step: 3,
            interval_seconds: 2.0,
        };
        let mut prev = 0;
        for i in 0..40 {
            let current = ramp.target_at(i as f64 * 0.5);
            assert!(current >= prev);
            assert!(current <= 20);
            prev = current;
        }
    }
}
