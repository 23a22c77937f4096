//! Test Runner: drives a single test through its phases (spec.md §4.5).
//!
//! `spawn` mirrors the shape of the teacher's `run_worker`/`run_scenario_worker`
//! entry points (`worker.rs`): build the collaborators, hand the caller a
//! handle to live state, and drive the actual loop on a detached
//! `tokio::spawn`ed task. What's new relative to the teacher is the explicit
//! phase state machine (`CREATED -> WARMUP? -> RUNNING -> DRAINING ->
//! {COMPLETED, STOPPED, FAILED}`) and the single shared `CancellationToken`
//! that both the submission loop and the rate controller observe.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LoadMode, TestConfig};
use crate::executor::TaskExecutor;
use crate::metrics::MetricsCollector;
use crate::ramp::RampStrategy;
use crate::rate_controller::{Permit, RateController};
use crate::registry::TaskRegistry;
use crate::task::Task;

/// Externally-visible run state (spec.md §3 `TestRun.state`). Transitions
/// are monotonic except `PENDING -> RUNNING`, after which the run proceeds
/// to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestState {
    Pending,
    Running,
    Stopping,
    Completed,
    Stopped,
    Failed,
}

impl TestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TestState::Completed | TestState::Stopped | TestState::Failed
        )
    }
}

/// How long the runner waits, after the main phase ends, for in-flight
/// tasks to finish before producing the final snapshot (spec.md §4.5).
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The ambient error type feeding a run's `FAILED` state (spec.md §7
/// "Fatal"). Both variants are discovered only after the run has started
/// (task construction and rate-controller construction both happen inside
/// the spawned task, not synchronously in `spawn`), so this is stored next
/// to `state` rather than returned from `spawn` — `TestExecutionService`
/// and the publisher read it off a run the same way they read `state`.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    #[error("task initialization failed: {0}")]
    TaskInit(String),
    #[error("rate controller initialization failed: {0}")]
    RateController(String),
}

/// How long the submission loop backs off after a saturated `try_submit`
/// before retrying, without dropping the permit it already holds (spec.md
/// §4.5 step 3, §9 "Back-pressure vs dropping").
const SATURATION_RETRY: Duration = Duration::from_millis(1);

/// Handle to a run in progress, returned by [`spawn`]. Owned by
/// [`crate::service::TestExecutionService`]; the `state`/`collector`/
/// `executor` fields are what `status()` and the publisher read.
pub struct SpawnedRun {
    pub state: Arc<Mutex<TestState>>,
    pub collector: Arc<MetricsCollector>,
    pub executor: Arc<TaskExecutor>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
    /// Set exactly once, before `state` transitions to `Failed`, on either
    /// fatal initialization path. `None` for any run that never fails fatally.
    pub failure: Arc<Mutex<Option<RunError>>>,
}

/// Constructs the executor, collector, and state cell, then spawns the
/// phase-driving loop. Per spec.md §7 "Fatal", a fatal initialization
/// failure (unknown task type, plugin `initialize`/`validate` rejection)
/// never prevents the run from being tracked — it ends the run in `FAILED`
/// without ever starting the submission loop, discovered inside the spawned
/// task rather than returned synchronously here. Callers (i.e.
/// [`crate::service::TestExecutionService::start`]) assume `config` already
/// passed [`TestConfig::validate`].
pub fn spawn(config: TestConfig, registry: Arc<TaskRegistry>) -> SpawnedRun {
    let ramp = config.ramp_strategy();
    let executor = Arc::new(TaskExecutor::new(ramp.starting_concurrency() as usize));
    let collector = Arc::new(MetricsCollector::new());
    let state = Arc::new(Mutex::new(TestState::Pending));
    let cancel = CancellationToken::new();
    let failure = Arc::new(Mutex::new(None));

    let handle = {
        let executor = executor.clone();
        let collector = collector.clone();
        let state = state.clone();
        let cancel = cancel.clone();
        let failure = failure.clone();
        tokio::spawn(async move {
            let task: Arc<dyn Task> = match registry.build(&config.task_type, &config.task_params)
            {
                Ok(task) => Arc::from(task),
                Err(source) => {
                    warn!(
                        task_type = %config.task_type,
                        error = %source,
                        "task initialization failed, run ends in FAILED"
                    );
                    crate::metrics_server::RUNS_FAILED_TOTAL.inc();
                    *failure.lock().unwrap() = Some(RunError::TaskInit(source.to_string()));
                    *state.lock().unwrap() = TestState::Failed;
                    return;
                }
            };

            let rate_controller = match config.load_mode {
                LoadMode::Concurrency => None,
                LoadMode::Rate {
                    target_tps,
                    rate_ramp_seconds,
                } => match RateController::new(
                    target_tps,
                    Duration::from_secs_f64(rate_ramp_seconds),
                    cancel.clone(),
                ) {
                    Ok(rc) => Some(Arc::new(rc)),
                    Err(source) => {
                        warn!(error = %source, "rate controller initialization failed, run ends in FAILED");
                        crate::metrics_server::RUNS_FAILED_TOTAL.inc();
                        *failure.lock().unwrap() =
                            Some(RunError::RateController(source.to_string()));
                        *state.lock().unwrap() = TestState::Failed;
                        return;
                    }
                },
            };

            crate::metrics_server::RUNS_STARTED_TOTAL.inc();
            run_to_completion(
                config,
                ramp,
                task,
                executor,
                collector,
                rate_controller,
                state,
                cancel,
            )
            .await;
        })
    };

    SpawnedRun {
        state,
        collector,
        executor,
        cancel,
        handle,
        failure,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_to_completion(
    config: TestConfig,
    ramp: RampStrategy,
    task: Arc<dyn Task>,
    executor: Arc<TaskExecutor>,
    collector: Arc<MetricsCollector>,
    rate_controller: Option<Arc<RateController>>,
    state: Arc<Mutex<TestState>>,
    cancel: CancellationToken,
) {
    *state.lock().unwrap() = TestState::Running;

    if config.warmup_s > 0 {
        info!(warmup_s = config.warmup_s, "warmup phase starting");
        run_phase(
            Duration::from_secs(config.warmup_s),
            &ramp,
            &task,
            &executor,
            rate_controller.as_deref(),
            None,
            &cancel,
        )
        .await;

        if !cancel.is_cancelled() {
            debug!("warmup complete, resetting collector and rate controller");
            collector.reset();
            if let Some(rc) = &rate_controller {
                rc.reset();
            }
        }
    }

    if !cancel.is_cancelled() {
        info!(duration_s = config.duration_s, "main phase starting");
        run_phase(
            Duration::from_secs(config.duration_s),
            &ramp,
            &task,
            &executor,
            rate_controller.as_deref(),
            Some(&collector),
            &cancel,
        )
        .await;
    }

    *state.lock().unwrap() = TestState::Stopping;
    executor.stop_accepting();
    let drained = executor.await_completion(DRAIN_TIMEOUT).await;
    if !drained {
        warn!(
            submitted = executor.submitted(),
            completed = executor.completed(),
            "drain timed out with tasks still in flight; completing best-effort"
        );
    }

    let terminal = if cancel.is_cancelled() {
        TestState::Stopped
    } else {
        TestState::Completed
    };
    match terminal {
        TestState::Stopped => crate::metrics_server::RUNS_STOPPED_TOTAL.inc(),
        TestState::Completed => crate::metrics_server::RUNS_COMPLETED_TOTAL.inc(),
        _ => unreachable!("terminal is always Stopped or Completed here"),
    }
    info!(?terminal, "run finished");
    *state.lock().unwrap() = terminal;
}

/// Drives one phase (warmup or main) per spec.md §4.5's run loop: ramp the
/// executor's ceiling, optionally wait for a rate-controller permit, then
/// submit a task, retrying on saturation without dropping the permit.
/// `collector` is `None` during warmup, whose results are discarded.
async fn run_phase(
    duration: Duration,
    ramp: &RampStrategy,
    task: &Arc<dyn Task>,
    executor: &Arc<TaskExecutor>,
    rate_controller: Option<&RateController>,
    collector: Option<&Arc<MetricsCollector>>,
    cancel: &CancellationToken,
) {
    let phase_start = Instant::now();
    let phase_end = phase_start + duration;

    while Instant::now() < phase_end && !cancel.is_cancelled() {
        let elapsed = phase_start.elapsed().as_secs_f64();
        executor.set_ceiling(ramp.target_at(elapsed) as usize);

        if let Some(rc) = rate_controller {
            if rc.acquire().await == Permit::Interrupted {
                break;
            }
        }

        loop {
            if cancel.is_cancelled() {
                return;
            }
            match executor.try_submit(task.clone()) {
                Some(rx) => {
                    if let Some(collector) = collector {
                        let collector = collector.clone();
                        tokio::spawn(async move {
                            if let Ok(result) = rx.await {
                                collector.record(&result);
                            }
                        });
                    }
                    break;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(SATURATION_RETRY) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RampKind;
    use std::collections::HashMap;

    fn config(overrides: impl FnOnce(&mut TestConfig)) -> TestConfig {
        let mut config = TestConfig {
            task_type: "sleep".to_string(),
            task_params: {
                let mut params = HashMap::new();
                params.insert("duration_ms".to_string(), "1".to_string());
                params
            },
            load_mode: LoadMode::Concurrency,
            max_concurrency: 20,
            starting_concurrency: 20,
            duration_s: 1,
            ramp_kind: RampKind::Constant,
            warmup_s: 0,
        };
        overrides(&mut config);
        config
    }

    #[tokio::test]
    async fn unknown_task_type_ends_in_failed_without_starting_the_loop() {
        let config = config(|c| c.task_type = "does-not-exist".to_string());
        let spawned = spawn(config, Arc::new(TaskRegistry::with_defaults()));
        spawned.handle.await.unwrap();

        assert_eq!(*spawned.state.lock().unwrap(), TestState::Failed);
        assert_eq!(spawned.executor.submitted(), 0);
        assert!(matches!(
            *spawned.failure.lock().unwrap(),
            Some(RunError::TaskInit(_))
        ));
    }

    #[tokio::test]
    async fn invalid_rate_controller_ends_in_failed_with_a_run_error() {
        let config = config(|c| {
            c.load_mode = LoadMode::Rate {
                target_tps: 0.0,
                rate_ramp_seconds: 0.0,
            };
        });
        let spawned = spawn(config, Arc::new(TaskRegistry::with_defaults()));
        spawned.handle.await.unwrap();

        assert_eq!(*spawned.state.lock().unwrap(), TestState::Failed);
        assert!(matches!(
            *spawned.failure.lock().unwrap(),
            Some(RunError::RateController(_))
        ));
    }

    #[tokio::test]
    async fn rate_mode_respects_target_tps_end_to_end() {
        // spec.md §8 scenario #1 ("Constant rate"): a rate-capped run should
        // land near target_tps * duration_s, not saturate at max_concurrency.
        let config = config(|c| {
            c.load_mode = LoadMode::Rate {
                target_tps: 50.0,
                rate_ramp_seconds: 0.0,
            };
            c.max_concurrency = 200;
            c.starting_concurrency = 200;
            c.duration_s = 2;
        });
        let spawned = spawn(config, Arc::new(TaskRegistry::with_defaults()));
        spawned.handle.await.unwrap();

        assert_eq!(*spawned.state.lock().unwrap(), TestState::Completed);
        let snapshot = spawned.collector.snapshot();
        assert_eq!(snapshot.success_rate, 100.0);
        // ~100 requests expected at 50 tps over 2s; generous bounds absorb
        // scheduling jitter per spec.md §8's `issued ≤ target_tps · D · (1 + ε)`.
        assert!(
            snapshot.total_requests >= 60 && snapshot.total_requests <= 140,
            "expected roughly 100 requests at 50 tps over 2s, got {}",
            snapshot.total_requests
        );
        assert!(
            snapshot.current_tps > 20.0 && snapshot.current_tps < 80.0,
            "expected current_tps near 50, got {}",
            snapshot.current_tps
        );
    }

    #[tokio::test]
    async fn a_short_run_completes_and_records_results() {
        let config = config(|_| {});
        let spawned = spawn(config, Arc::new(TaskRegistry::with_defaults()));
        spawned.handle.await.unwrap();

        assert_eq!(*spawned.state.lock().unwrap(), TestState::Completed);
        let snapshot = spawned.collector.snapshot();
        assert!(snapshot.total_requests > 0);
        assert_eq!(snapshot.success_rate, 100.0);
    }

    #[tokio::test]
    async fn warmup_results_are_discarded_from_final_snapshot() {
        let config = config(|c| {
            c.warmup_s = 1;
            c.duration_s = 1;
        });
        let spawned = spawn(config, Arc::new(TaskRegistry::with_defaults()));
        spawned.handle.await.unwrap();

        // The collector was reset at the warmup/main boundary, so its
        // elapsed time reflects only the main phase.
        let snapshot = spawned.collector.snapshot();
        assert!(snapshot.elapsed_secs < 1.5);
    }

    #[tokio::test]
    async fn cancel_mid_run_stops_within_drain_window() {
        let config = config(|c| {
            c.duration_s = 60;
            c.max_concurrency = 5;
            c.starting_concurrency = 5;
        });
        let spawned = spawn(config, Arc::new(TaskRegistry::with_defaults()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        spawned.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), spawned.handle)
            .await
            .expect("run should stop well within the drain window")
            .unwrap();

        assert_eq!(*spawned.state.lock().unwrap(), TestState::Stopped);
        assert!(spawned.collector.snapshot().total_requests > 0);
    }
}
