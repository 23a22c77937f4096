//! Injectable time source (spec.md §2.2: rate controller and ramp strategy
//! must be testable without real wall-clock sleeps).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time. Production code uses [`SystemClock`]; tests
/// use [`MockClock`] to drive ramp/rate-controller logic deterministically.
pub trait Clock: Send + Sync {
    /// Nanoseconds elapsed since some fixed, clock-specific epoch. Only
    /// differences between two calls are meaningful.
    fn now_nanos(&self) -> u64;

    fn now(&self) -> Instant;
}

/// The real clock, backed by `Instant`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        // Relative to process start; see `Instant::now()` docs for why this
        // can't be tied to the Unix epoch without pulling in `SystemTime`.
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = *START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose value only advances when told to. Shared via `Arc` so a
/// test can hold a handle while the component under test holds a trait
/// object pointing at the same counter.
#[derive(Clone)]
pub struct MockClock {
    nanos: Arc<AtomicU64>,
    base: Instant,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(0)),
            base: Instant::now(),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn now(&self) -> Instant {
        self.base + Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances_deterministically() {
        let clock = MockClock::new();
        assert_eq!(clock.now_nanos(), 0);
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now_nanos(), 5_000_000);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }
}
