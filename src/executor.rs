//! Task executor: a bounded pool of cooperatively scheduled workers.
//!
//! Grounded in the teacher's `worker.rs` scheduling model (many lightweight
//! `tokio::spawn`ed tasks, no kernel-thread-per-task cost) generalized from a
//! single long-running HTTP loop into a general submit/await executor per
//! spec.md §4.3. Capacity gating uses `tokio::sync::Semaphore` as the
//! counting semaphore the spec calls for; a panicking task body is caught by
//! `tokio::spawn`'s own unwind boundary (its `JoinHandle` resolves to `Err`
//! instead of propagating), so the worker driving the executor never goes
//! down with it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use crate::task::{Task, TaskResult};

#[derive(Debug, thiserror::Error)]
#[error("executor is closed")]
pub struct ExecutorClosed;

/// A bounded pool that executes submitted tasks concurrently under a ceiling
/// of `max_concurrent` in-flight executions. The ceiling can be raised or
/// lowered while the executor is running (see [`TaskExecutor::set_ceiling`]),
/// which is how the runner applies a ramp strategy's target concurrency.
pub struct TaskExecutor {
    semaphore: Arc<Semaphore>,
    ceiling: AtomicUsize,
    submitted: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl TaskExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            ceiling: AtomicUsize::new(max_concurrent),
            submitted: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Raises or lowers the in-flight ceiling to `new_ceiling`, adding or
    /// forgetting semaphore permits to match. Lowering never preempts
    /// already-running tasks; it only shrinks the pool of permits available
    /// to future submissions, so `active()` can briefly exceed `new_ceiling`
    /// until enough in-flight tasks complete.
    pub fn set_ceiling(&self, new_ceiling: usize) {
        let previous = self.ceiling.swap(new_ceiling, Ordering::SeqCst);
        if new_ceiling > previous {
            self.semaphore.add_permits(new_ceiling - previous);
        } else if new_ceiling < previous {
            self.semaphore.forget_permits(previous - new_ceiling);
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::SeqCst)
    }

    /// Enqueues `task`, blocking until a worker slot is free (or the
    /// executor is closed). Returns a receiver that resolves with the
    /// task's `TaskResult` once execution completes.
    pub async fn submit(
        &self,
        task: Arc<dyn Task>,
    ) -> Result<oneshot::Receiver<TaskResult>, ExecutorClosed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorClosed);
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed while the executor is alive");
        Ok(self.spawn_worker(task, permit))
    }

    /// Non-blocking variant of `submit`. Returns `None` immediately if every
    /// worker slot is currently in use, instead of waiting for one to free.
    pub fn try_submit(&self, task: Arc<dyn Task>) -> Option<oneshot::Receiver<TaskResult>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.spawn_worker(task, permit))
    }

    fn spawn_worker(
        &self,
        task: Arc<dyn Task>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> oneshot::Receiver<TaskResult> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        crate::metrics_server::TASKS_SUBMITTED_TOTAL.inc();
        let completed = self.completed.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let _permit = permit;
            let result = match tokio::spawn(async move { task.execute().await }).await {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(error = %join_error, "task body panicked, converting to failed result");
                    TaskResult::failure(0, Duration::ZERO, format!("panic: {join_error}"))
                }
            };
            completed.fetch_add(1, Ordering::SeqCst);
            crate::metrics_server::TASKS_COMPLETED_TOTAL.inc();
            // The receiver may have been dropped (caller used try_submit and
            // discarded the handle); that's not our problem to report.
            let _ = tx.send(result);
        });

        rx
    }

    /// Number of tasks currently executing.
    pub fn active(&self) -> usize {
        self.ceiling()
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Blocks until `submitted == completed` or `timeout` elapses. Returns
    /// `true` if fully drained, `false` on timeout.
    pub async fn await_completion(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.submitted() == self.completed() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(
                    submitted = self.submitted(),
                    completed = self.completed(),
                    "await_completion timed out with tasks still in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Rejects every submission from this point on, without waiting for
    /// in-flight tasks. Used at the end of a run's main phase, ahead of a
    /// bounded `await_completion` drain.
    pub fn stop_accepting(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Rejects new submissions, then waits (unbounded) for in-flight tasks
    /// to drain, releasing every worker slot back to the semaphore.
    pub async fn close(&self) {
        self.stop_accepting();
        let _ = self.await_completion(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskError, TaskMetadata, TaskParams};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct InstantTask {
        succeed: bool,
    }

    #[async_trait]
    impl Task for InstantTask {
        fn metadata(&self) -> TaskMetadata {
            TaskMetadata {
                name: "instant".into(),
                display_name: "Instant".into(),
                category: "test".into(),
                parameters: vec![],
            }
        }
        fn validate(&self, _params: &TaskParams) -> Result<(), TaskError> {
            Ok(())
        }
        fn initialize(&mut self, _params: &TaskParams) -> Result<(), TaskError> {
            Ok(())
        }
        async fn execute(&self) -> TaskResult {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.succeed {
                TaskResult::success(1, Duration::from_millis(1))
            } else {
                TaskResult::failure(1, Duration::from_millis(1), "boom")
            }
        }
    }

    struct PanicTask;

    #[async_trait]
    impl Task for PanicTask {
        fn metadata(&self) -> TaskMetadata {
            TaskMetadata {
                name: "panic".into(),
                display_name: "Panic".into(),
                category: "test".into(),
                parameters: vec![],
            }
        }
        fn validate(&self, _params: &TaskParams) -> Result<(), TaskError> {
            Ok(())
        }
        fn initialize(&mut self, _params: &TaskParams) -> Result<(), TaskError> {
            Ok(())
        }
        async fn execute(&self) -> TaskResult {
            panic!("deliberate test panic");
        }
    }

    #[tokio::test]
    async fn submit_runs_task_and_reports_result() {
        let executor = TaskExecutor::new(4);
        let rx = executor
            .submit(Arc::new(InstantTask { succeed: true }))
            .await
            .unwrap();
        let result = rx.await.unwrap();
        assert!(result.success);
        assert!(executor.await_completion(Duration::from_secs(1)).await);
        assert_eq!(executor.submitted(), 1);
        assert_eq!(executor.completed(), 1);
    }

    #[tokio::test]
    async fn panicking_task_becomes_a_failed_result() {
        let executor = TaskExecutor::new(1);
        let rx = executor.submit(Arc::new(PanicTask)).await.unwrap();
        let result = rx.await.unwrap();
        assert!(!result.success);
        assert!(result.error_message.contains("panic"));
    }

    #[tokio::test]
    async fn active_never_exceeds_max_concurrency() {
        let executor = Arc::new(TaskExecutor::new(3));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let executor = executor.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let rx = executor
                    .submit(Arc::new(InstantTask { succeed: true }))
                    .await
                    .unwrap();
                peak.fetch_max(executor.active(), Ordering::SeqCst);
                let _ = rx.await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(executor.await_completion(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn try_submit_returns_none_when_saturated() {
        let executor = TaskExecutor::new(1);
        let _rx = executor
            .submit(Arc::new(InstantTask { succeed: true }))
            .await
            .unwrap();
        assert!(executor
            .try_submit(Arc::new(InstantTask { succeed: true }))
            .is_none());
        assert!(executor.await_completion(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn set_ceiling_raises_and_lowers_capacity() {
        let executor = TaskExecutor::new(2);
        assert_eq!(executor.ceiling(), 2);
        executor.set_ceiling(5);
        assert_eq!(executor.ceiling(), 5);
        assert_eq!(executor.semaphore.available_permits(), 5);
        executor.set_ceiling(1);
        assert_eq!(executor.ceiling(), 1);
        assert_eq!(executor.semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn close_rejects_new_submissions() {
        let executor = TaskExecutor::new(2);
        executor.close().await;
        let result = executor
            .submit(Arc::new(InstantTask { succeed: true }))
            .await;
        assert!(result.is_err());
    }
}
