//! Explicit task registry and reference task plugins.
//!
//! REDESIGN FLAG (spec.md §9, "Plugin dispatch"): the original annotation-
//! scanning approach is replaced with an explicit, compile-time registry of
//! constructor functions. No reflection, no dynamic discovery — a task type
//! is available if and only if it is registered here or by the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::errors::ErrorCategory;
use crate::task::{Task, TaskError, TaskMetadata, TaskParameterSpec, TaskParams, TaskResult};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no task registered under name '{0}'")]
    UnknownTask(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

type TaskConstructor = fn() -> Box<dyn Task>;

/// Maps a task type name to a constructor function.
///
/// Construction and parameter application (`initialize`) are separate steps
/// so a registry lookup failure (unknown name) and a parameter failure
/// (bad value) surface as distinct `RegistryError` variants.
pub struct TaskRegistry {
    constructors: HashMap<&'static str, TaskConstructor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The registry pre-populated with the three reference tasks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("sleep", || Box::new(SleepTask::default()));
        registry.register("hash", || Box::new(HashTask::default()));
        registry.register("http_get", || Box::new(HttpGetTask::default()));
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: TaskConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    /// Builds and initializes a task instance by name.
    pub fn build(&self, name: &str, params: &TaskParams) -> Result<Box<dyn Task>, RegistryError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))?;
        let mut task = constructor();
        task.validate(params)?;
        task.initialize(params)?;
        Ok(task)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn required_param(params: &TaskParams, name: &str) -> Result<String, TaskError> {
    params
        .get(name)
        .cloned()
        .ok_or_else(|| TaskError::MissingParameter(name.to_string()))
}

fn parse_param<T: std::str::FromStr>(
    params: &TaskParams,
    name: &str,
    default: T,
) -> Result<T, TaskError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| TaskError::InvalidParameter {
            name: name.to_string(),
            message: format!("could not parse '{}'", raw),
        }),
    }
}

/// Sleeps for a configured duration. Always succeeds. Exercises the executor
/// and rate controller without depending on an external service, used
/// throughout the end-to-end scenarios in §8.
pub struct SleepTask {
    task_id: i64,
    duration: Duration,
}

impl Default for SleepTask {
    fn default() -> Self {
        Self {
            task_id: 1,
            duration: Duration::from_millis(10),
        }
    }
}

#[async_trait]
impl Task for SleepTask {
    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            name: "sleep".to_string(),
            display_name: "Sleep".to_string(),
            category: "synthetic".to_string(),
            parameters: vec![TaskParameterSpec {
                name: "duration_ms".to_string(),
                description: "how long to sleep per execution, in milliseconds".to_string(),
                required: false,
            }],
        }
    }

    fn validate(&self, params: &TaskParams) -> Result<(), TaskError> {
        parse_param::<u64>(params, "duration_ms", 10).map(|_| ())
    }

    fn initialize(&mut self, params: &TaskParams) -> Result<(), TaskError> {
        let millis = parse_param::<u64>(params, "duration_ms", 10)?;
        self.duration = Duration::from_millis(millis);
        Ok(())
    }

    async fn execute(&self) -> TaskResult {
        let start = Instant::now();
        tokio::time::sleep(self.duration).await;
        TaskResult::success(self.task_id, start.elapsed())
    }
}

/// Hashes a configured payload a configured number of times. CPU-bound
/// synthetic work, the compute-heavy counterpart to `SleepTask`'s I/O-bound
/// wait. Always succeeds.
pub struct HashTask {
    task_id: i64,
    payload: Vec<u8>,
    iterations: u32,
}

impl Default for HashTask {
    fn default() -> Self {
        Self {
            task_id: 2,
            payload: b"loadgen".to_vec(),
            iterations: 1000,
        }
    }
}

#[async_trait]
impl Task for HashTask {
    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            name: "hash".to_string(),
            display_name: "Hash".to_string(),
            category: "synthetic".to_string(),
            parameters: vec![
                TaskParameterSpec {
                    name: "payload".to_string(),
                    description: "the string payload to hash repeatedly".to_string(),
                    required: false,
                },
                TaskParameterSpec {
                    name: "iterations".to_string(),
                    description: "number of times to re-hash the payload".to_string(),
                    required: false,
                },
            ],
        }
    }

    fn validate(&self, params: &TaskParams) -> Result<(), TaskError> {
        parse_param::<u32>(params, "iterations", 1000).map(|_| ())
    }

    fn initialize(&mut self, params: &TaskParams) -> Result<(), TaskError> {
        if let Some(payload) = params.get("payload") {
            self.payload = payload.as_bytes().to_vec();
        }
        self.iterations = parse_param::<u32>(params, "iterations", 1000)?;
        Ok(())
    }

    async fn execute(&self) -> TaskResult {
        let start = Instant::now();
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut digest = 0u64;
        for _ in 0..self.iterations {
            let mut hasher = DefaultHasher::new();
            self.payload.hash(&mut hasher);
            digest = digest.wrapping_add(hasher.finish());
        }

        TaskResult::success(self.task_id, start.elapsed())
            .with_metadata(json!({ "digest": digest }))
    }
}

/// Issues a GET request against a configured URL via `reqwest::Client`.
/// Success is HTTP 2xx/3xx; anything else (including a transport-level
/// error) is a failure, categorized with [`ErrorCategory`].
pub struct HttpGetTask {
    task_id: i64,
    url: String,
    client: Arc<reqwest::Client>,
}

impl Default for HttpGetTask {
    fn default() -> Self {
        Self {
            task_id: 3,
            url: String::new(),
            client: Arc::new(reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl Task for HttpGetTask {
    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            name: "http_get".to_string(),
            display_name: "HTTP GET".to_string(),
            category: "network".to_string(),
            parameters: vec![TaskParameterSpec {
                name: "url".to_string(),
                description: "the URL to GET on each execution".to_string(),
                required: true,
            }],
        }
    }

    fn validate(&self, params: &TaskParams) -> Result<(), TaskError> {
        let url = required_param(params, "url")?;
        url.parse::<reqwest::Url>()
            .map(|_| ())
            .map_err(|e| TaskError::InvalidParameter {
                name: "url".to_string(),
                message: e.to_string(),
            })
    }

    fn initialize(&mut self, params: &TaskParams) -> Result<(), TaskError> {
        self.url = required_param(params, "url")?;
        Ok(())
    }

    async fn execute(&self) -> TaskResult {
        let start = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                let size = response.content_length().unwrap_or(0) as i32;
                match ErrorCategory::from_status_code(status.as_u16()) {
                    None => TaskResult::success(self.task_id, start.elapsed())
                        .with_response_size(size),
                    Some(category) => TaskResult::failure(
                        self.task_id,
                        start.elapsed(),
                        format!("{}: HTTP {}", category.label(), status.as_u16()),
                    ),
                }
            }
            Err(e) => {
                let category = ErrorCategory::from_reqwest_error(&e);
                TaskResult::failure(
                    self.task_id,
                    start.elapsed(),
                    format!("{}: {}", category.label(), e),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_defaults_registers_three_tasks() {
        let registry = TaskRegistry::with_defaults();
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["hash", "http_get", "sleep"]);
    }

    #[test]
    fn build_unknown_name_errors() {
        let registry = TaskRegistry::with_defaults();
        let err = registry.build("nonexistent", &TaskParams::new());
        assert!(matches!(err, Err(RegistryError::UnknownTask(_))));
    }

    #[test]
    fn http_get_requires_url() {
        let registry = TaskRegistry::with_defaults();
        let err = registry.build("http_get", &TaskParams::new());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn sleep_task_executes_and_succeeds() {
        let mut params = TaskParams::new();
        params.insert("duration_ms".to_string(), "1".to_string());
        let registry = TaskRegistry::with_defaults();
        let task = registry.build("sleep", &params).unwrap();
        let result = task.execute().await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn hash_task_executes_and_succeeds() {
        let registry = TaskRegistry::with_defaults();
        let task = registry.build("hash", &TaskParams::new()).unwrap();
        let result = task.execute().await;
        assert!(result.success);
        assert!(result.metadata.is_some());
    }
}
