//! Metrics collector: lock-light aggregation of `TaskResult`s into a
//! bounded-memory, point-in-time snapshot.
//!
//! The teacher's own `metrics.rs` wires a global Prometheus registry behind
//! `lazy_static`; that pull-based exposition model is kept, relocated to
//! [`crate::metrics_server`], since it's a reasonable companion to this
//! push-based collector rather than a replacement for it. This module is
//! grounded instead in the teacher's `percentiles.rs` (bounded-sample
//! percentile tracking) and `throughput.rs` (sliding-window rate tracking),
//! generalized per spec.md §4.4 into a single collector that owns latency,
//! throughput, and error aggregation together.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::task::TaskResult;

/// Bound on the latency reservoir (spec.md §4.4 `MAX_LAT`).
pub const MAX_LATENCY_SAMPLES: usize = 10_000;

/// Soft bound on the completion-timestamp window (spec.md §4.4 `MAX_TS`).
pub const MAX_TIMESTAMPS: usize = 100_000;

/// Width of the sliding window used for `current_tps` (spec.md §4.4
/// `TPS_WINDOW_MS`).
pub const TPS_WINDOW_MS: u64 = 5_000;

/// Error messages are truncated to this many characters (plus `"..."`)
/// before becoming a histogram key, so a handful of distinct errors with
/// long, varying suffixes (a stack trace, a URL with a random id) don't
/// blow up the histogram's cardinality.
const ERROR_MESSAGE_TRUNCATE_LEN: usize = 100;

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_TRUNCATE_LEN {
        message.to_string()
    } else {
        let truncated: String = message.chars().take(ERROR_MESSAGE_TRUNCATE_LEN).collect();
        format!("{truncated}...")
    }
}

/// Per-percentile latency readings, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(rename = "p99.9")]
    pub p99_9: f64,
}

/// Point-in-time, immutable copy of collector state. Safe to share freely
/// (e.g. across publisher subscribers) since nothing in it is mutated after
/// construction.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Filled in by the publisher from the run it belongs to; the collector
    /// itself has no notion of which test it's attached to.
    #[serde(default)]
    pub test_id: String,
    pub timestamp_ms: u64,
    pub elapsed_secs: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    /// Filled in by the publisher from the executor; the collector itself
    /// has no notion of "currently executing".
    #[serde(default)]
    pub active_tasks: u64,
    pub current_tps: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub latency_percentiles: LatencyPercentiles,
    pub error_histogram: HashMap<String, u64>,
}

/// Thread-safe aggregator of `TaskResult`s from many concurrent producers.
///
/// Counters are plain atomics. The latency reservoir and timestamp window
/// are FIFOs behind a `Mutex` each — a `Mutex<VecDeque<_>>` push/pop is cheap
/// enough at this cardinality that a lock-free ring buffer isn't worth the
/// complexity. Per spec.md §9's "Shared mutable counters" note, atomics
/// replace the teacher's ad-hoc "atomic long + concurrent map" idiom; the
/// bounded-reservoir-plus-interpolation percentile scheme is the simpler
/// substitute spec.md §9 explicitly sanctions in place of an HDR histogram
/// (the teacher's own `PercentileTracker` wraps `hdrhistogram::Histogram`
/// behind a `Mutex`, not a bounded queue — a different trade-off, not the
/// same one).
pub struct MetricsCollector {
    start_time: Mutex<Instant>,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    sum_latency_ns: AtomicI64,
    reservoir: Mutex<VecDeque<i64>>,
    timestamps: Mutex<VecDeque<Instant>>,
    error_histogram: Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Mutex::new(Instant::now()),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sum_latency_ns: AtomicI64::new(0),
            reservoir: Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
            timestamps: Mutex::new(VecDeque::with_capacity(MAX_TIMESTAMPS)),
            error_histogram: Mutex::new(HashMap::new()),
        }
    }

    /// Records one task outcome. Safe to call from any number of producer
    /// tasks concurrently without external locking.
    pub fn record(&self, result: &TaskResult) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum_latency_ns
            .fetch_add(result.latency_ns, Ordering::Relaxed);

        {
            let mut timestamps = self.timestamps.lock().unwrap();
            timestamps.push_back(Instant::now());
            if timestamps.len() > MAX_TIMESTAMPS {
                timestamps.pop_front();
            }
        }

        if result.success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            let key = truncate_error(&result.error_message);
            let mut histogram = self.error_histogram.lock().unwrap();
            *histogram.entry(key).or_insert(0) += 1;
        }

        {
            let mut reservoir = self.reservoir.lock().unwrap();
            reservoir.push_back(result.latency_ns);
            while reservoir.len() > MAX_LATENCY_SAMPLES {
                reservoir.pop_front();
            }
        }
    }

    /// Zeroes counters and clears the reservoir, timestamp window, and
    /// error histogram. `start_time` is re-seated to now. Called at the
    /// warmup/main phase boundary.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.sum_latency_ns.store(0, Ordering::Relaxed);
        self.reservoir.lock().unwrap().clear();
        self.timestamps.lock().unwrap().clear();
        self.error_histogram.lock().unwrap().clear();
        *self.start_time.lock().unwrap() = Instant::now();
    }

    /// Computes an immutable point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let sum_latency_ns = self.sum_latency_ns.load(Ordering::Relaxed);
        let start_time = *self.start_time.lock().unwrap();
        let elapsed = start_time.elapsed();

        let now = Instant::now();
        let window = Duration::from_millis(TPS_WINDOW_MS);
        let current_tps = {
            let mut timestamps = self.timestamps.lock().unwrap();
            while let Some(&oldest) = timestamps.front() {
                if now.duration_since(oldest) > window {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            if !timestamps.is_empty() {
                timestamps.len() as f64 * 1000.0 / TPS_WINDOW_MS as f64
            } else if elapsed.as_secs_f64() > 0.0 {
                total as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            }
        };

        let avg_latency_ms = if total > 0 {
            sum_latency_ns as f64 / total as f64 / 1_000_000.0
        } else {
            0.0
        };

        let success_rate = if total > 0 {
            100.0 * successful as f64 / total as f64
        } else {
            0.0
        };

        let reservoir_copy: Vec<i64> = self.reservoir.lock().unwrap().iter().copied().collect();
        let (min_latency_ms, max_latency_ms, latency_percentiles) =
            compute_latency_stats(&reservoir_copy);

        MetricsSnapshot {
            test_id: String::new(),
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            elapsed_secs: elapsed.as_secs_f64(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate,
            active_tasks: 0,
            current_tps,
            avg_latency_ms,
            min_latency_ms,
            max_latency_ms,
            latency_percentiles,
            error_histogram: self.error_histogram.lock().unwrap().clone(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorts a copy of the reservoir and computes min/max plus the percentiles
/// in §6's "Metrics snapshot JSON fields" list, via linear interpolation
/// between adjacent order statistics. An empty reservoir yields all zeros,
/// per spec.md §4.4.
fn compute_latency_stats(samples_ns: &[i64]) -> (f64, f64, LatencyPercentiles) {
    if samples_ns.is_empty() {
        return (0.0, 0.0, LatencyPercentiles::default());
    }

    let mut sorted = samples_ns.to_vec();
    sorted.sort_unstable();

    let to_ms = |ns: i64| ns as f64 / 1_000_000.0;
    let min_latency_ms = to_ms(sorted[0]);
    let max_latency_ms = to_ms(*sorted.last().unwrap());

    let percentile = |p: f64| -> f64 {
        let rank = p / 100.0 * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            to_ms(sorted[lower])
        } else {
            let fraction = rank - lower as f64;
            let lower_ms = to_ms(sorted[lower]);
            let upper_ms = to_ms(sorted[upper]);
            lower_ms + (upper_ms - lower_ms) * fraction
        }
    };

    let percentiles = LatencyPercentiles {
        p50: percentile(50.0),
        p75: percentile(75.0),
        p90: percentile(90.0),
        p95: percentile(95.0),
        p99: percentile(99.0),
        p99_9: percentile(99.9),
    };

    (min_latency_ms, max_latency_ms, percentiles)
}
