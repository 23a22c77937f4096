//! Test Execution Service: tracks multiple concurrent runs by id (spec.md
//! §4.6).
//!
//! Grounded in the teacher's global `lazy_static` registries pattern
//! (`GLOBAL_REQUEST_PERCENTILES` et al. in the now-removed `percentiles.rs`)
//! generalized into an instance-owned map rather than a process-global, so
//! multiple services (e.g. one per test) can coexist in-process for tests.
//! The map itself is a `std::sync::RwLock<HashMap<..>>` per spec.md §5
//! ("concurrent, many readers, few writers").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigError, TestConfig};
use crate::executor::TaskExecutor;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::registry::TaskRegistry;
use crate::runner::{self, TestState};

/// Only synchronous config-range rejection prevents a run from being
/// tracked at all (spec.md §7 "Validation"). A fatal initialization failure
/// (unknown task type, plugin rejection) still creates a run, which reaches
/// `FAILED` on its own (spec.md §7 "Fatal") — `start` never returns that as
/// an `Err`.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct ActiveRun {
    config: TestConfig,
    state: Arc<std::sync::Mutex<TestState>>,
    collector: Arc<MetricsCollector>,
    executor: Arc<TaskExecutor>,
    cancel: CancellationToken,
    started_at: Instant,
    failure: Arc<std::sync::Mutex<Option<runner::RunError>>>,
    // Kept alive for the run's lifetime; dropping it would detach (not
    // cancel) the background task, but we never want that to happen
    // silently while the run is still tracked.
    _handle: JoinHandle<()>,
}

/// Brief, list-friendly view of one run (spec.md §4.6 `list_active`).
#[derive(Debug, Clone, Serialize)]
pub struct TestBrief {
    pub test_id: String,
    pub status: TestState,
    pub elapsed_seconds: f64,
}

/// Full status view of one run (spec.md §6 `GET /api/tests/{id}`).
#[derive(Debug, Clone, Serialize)]
pub struct TestStatus {
    pub test_id: String,
    pub status: TestState,
    pub elapsed_seconds: f64,
    pub configuration: TestConfig,
    pub current_metrics: MetricsSnapshot,
}

/// Owns every run the process knows about, keyed by a short opaque id.
/// Terminal runs stay in the map until [`TestExecutionService::sweep`]
/// removes them (the publisher does this after observing the terminal
/// transition at least once), matching spec.md §4.6's "or the map is swept
/// on read" option.
pub struct TestExecutionService {
    runs: RwLock<HashMap<String, ActiveRun>>,
    registry: Arc<TaskRegistry>,
}

impl TestExecutionService {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// Validates `config`, assigns a new id, launches the runner, and
    /// returns immediately. No state is created on validation failure
    /// (spec.md §7 "Validation").
    pub fn start(&self, config: TestConfig) -> Result<String, StartError> {
        config.validate()?;

        let test_id = generate_test_id();
        let spawned = runner::spawn(config.clone(), self.registry.clone());

        let active = ActiveRun {
            config,
            state: spawned.state,
            collector: spawned.collector,
            executor: spawned.executor,
            cancel: spawned.cancel,
            started_at: Instant::now(),
            failure: spawned.failure,
            _handle: spawned.handle,
        };

        self.runs.write().unwrap().insert(test_id.clone(), active);
        info!(test_id = %test_id, "test started");
        Ok(test_id)
    }

    /// `None` if `test_id` is unknown (spec.md §4.6 `status`).
    pub fn status(&self, test_id: &str) -> Option<TestStatus> {
        let runs = self.runs.read().unwrap();
        let run = runs.get(test_id)?;
        Some(TestStatus {
            test_id: test_id.to_string(),
            status: *run.state.lock().unwrap(),
            elapsed_seconds: run.started_at.elapsed().as_secs_f64(),
            configuration: run.config.clone(),
            current_metrics: run.collector.snapshot(),
        })
    }

    /// Flips the cancel flag. Returns `true` iff the run existed and was
    /// not already terminal (spec.md §4.6 `stop`).
    pub fn stop(&self, test_id: &str) -> bool {
        let runs = self.runs.read().unwrap();
        let Some(run) = runs.get(test_id) else {
            return false;
        };
        let mut state = run.state.lock().unwrap();
        if state.is_terminal() {
            return false;
        }
        *state = TestState::Stopping;
        drop(state);
        run.cancel.cancel();
        info!(test_id, "stop requested");
        true
    }

    /// Every run that hasn't reached a terminal state yet (spec.md §4.6
    /// `list_active`).
    pub fn list_active(&self) -> HashMap<String, TestBrief> {
        self.runs
            .read()
            .unwrap()
            .iter()
            .filter_map(|(id, run)| {
                let status = *run.state.lock().unwrap();
                (!status.is_terminal()).then(|| {
                    (
                        id.clone(),
                        TestBrief {
                            test_id: id.clone(),
                            status,
                            elapsed_seconds: run.started_at.elapsed().as_secs_f64(),
                        },
                    )
                })
            })
            .collect()
    }

    /// Every tracked run's current state, terminal or not. Used by the
    /// publisher to detect transitions it should emit a `StatusEvent` for.
    pub(crate) fn all_states(&self) -> Vec<(String, TestState)> {
        self.runs
            .read()
            .unwrap()
            .iter()
            .map(|(id, run)| (id.clone(), *run.state.lock().unwrap()))
            .collect()
    }

    pub(crate) fn active_tasks(&self, test_id: &str) -> Option<usize> {
        self.runs
            .read()
            .unwrap()
            .get(test_id)
            .map(|run| run.executor.active())
    }

    pub(crate) fn snapshot_for(&self, test_id: &str) -> Option<MetricsSnapshot> {
        self.runs
            .read()
            .unwrap()
            .get(test_id)
            .map(|run| run.collector.snapshot())
    }

    /// The fatal `RunError` that drove `test_id` into `FAILED`, if any.
    /// Used by the publisher to populate `StatusEvent::data` on that
    /// transition (spec.md §6 `StatusEvent`, SPEC_FULL.md §4.9 `RunError`).
    pub(crate) fn failure_for(&self, test_id: &str) -> Option<runner::RunError> {
        self.runs
            .read()
            .unwrap()
            .get(test_id)?
            .failure
            .lock()
            .unwrap()
            .clone()
    }

    /// Removes a terminal run from the map. A no-op (returns `false`) if
    /// the run is unknown or not yet terminal.
    pub fn sweep(&self, test_id: &str) -> bool {
        let should_remove = self
            .runs
            .read()
            .unwrap()
            .get(test_id)
            .map(|run| run.state.lock().unwrap().is_terminal())
            .unwrap_or(false);
        if should_remove {
            self.runs.write().unwrap().remove(test_id);
        }
        should_remove
    }
}

fn generate_test_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
