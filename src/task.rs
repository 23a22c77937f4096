//! Task plugin interface consumed by the execution engine.
//!
//! A `Task` is opaque synthetic work: the engine only ever calls `execute()`
//! and converts whatever comes back (or whatever panics/errors) into a
//! [`TaskResult`]. Discovery, annotation scanning, and parameter schemas are
//! the plugin registry's concern (see [`crate::registry`]), not this trait's.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Immutable outcome of a single task execution.
///
/// Produced inside a task body, consumed exactly once by the
/// [`crate::metrics::MetricsCollector`].
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Identifies which task definition produced this result. Stable across
    /// every execution of the same configured task within a run.
    pub task_id: i64,

    /// Wall-clock latency of the single execution, in nanoseconds.
    pub latency_ns: i64,

    /// Whether the task considers itself successful.
    pub success: bool,

    /// Empty when `success` is true. Truncated to 100 chars + "..." by the
    /// collector before it becomes a histogram key (see §7 of the spec).
    pub error_message: String,

    /// Size of whatever payload the task produced, if applicable.
    pub response_size: i32,

    /// Opaque, task-defined extra data. The engine never inspects this.
    pub metadata: Option<Value>,
}

impl TaskResult {
    /// Build a successful result with no payload/metadata.
    pub fn success(task_id: i64, latency: Duration) -> Self {
        Self {
            task_id,
            latency_ns: latency.as_nanos() as i64,
            success: true,
            error_message: String::new(),
            response_size: 0,
            metadata: None,
        }
    }

    /// Build a failed result carrying the given error message.
    pub fn failure(task_id: i64, latency: Duration, error_message: impl Into<String>) -> Self {
        Self {
            task_id,
            latency_ns: latency.as_nanos() as i64,
            success: false,
            error_message: error_message.into(),
            response_size: 0,
            metadata: None,
        }
    }

    pub fn with_response_size(mut self, size: i32) -> Self {
        self.response_size = size;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Declarative description of a task type, for UI/discovery purposes.
///
/// The engine itself only needs `name`; the rest exists so an external
/// control surface can render a form for `parameters` without the engine
/// knowing anything about that surface.
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    pub name: String,
    pub display_name: String,
    pub category: String,
    pub parameters: Vec<TaskParameterSpec>,
}

#[derive(Debug, Clone)]
pub struct TaskParameterSpec {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Raw parameter bag passed to `validate`/`initialize`. Plugins parse their
/// own keys out of this; the engine treats it as opaque.
pub type TaskParams = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("initialization failed: {0}")]
    InitFailed(String),
}

/// A unit of synthetic work. Opaque to the engine beyond this trait.
///
/// `execute` is async because task bodies routinely perform blocking I/O
/// (an HTTP call, a DB round-trip); the engine relies on the async runtime
/// to multiplex many in-flight tasks onto a small thread pool rather than
/// spawning a kernel thread per task.
#[async_trait]
pub trait Task: Send + Sync {
    /// Declarative metadata for discovery/UI. The engine itself never calls
    /// this on the hot path.
    fn metadata(&self) -> TaskMetadata;

    /// Checks `params` for validity without side effects.
    fn validate(&self, params: &TaskParams) -> Result<(), TaskError>;

    /// Applies `params`, preparing the task to be executed repeatedly.
    /// Called once before a run starts. A failure here is fatal to the run
    /// (see §4.5/§7 "Fatal" error category) — it never starts the loop.
    fn initialize(&mut self, params: &TaskParams) -> Result<(), TaskError>;

    /// Executes one unit of work and reports the outcome.
    ///
    /// Implementations should not panic for ordinary failures (network
    /// errors, non-2xx responses, ...) — report them via a failed
    /// `TaskResult` instead. The executor catches panics that do escape and
    /// converts them to a failed result too (see [`crate::executor`]), but
    /// that path loses whatever state the panic unwound through.
    async fn execute(&self) -> TaskResult;
}
