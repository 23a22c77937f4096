//! Metrics Publisher: fans out periodic snapshots and status transitions to
//! subscribers (spec.md §4.7, §6 "Metrics subscription interface").
//!
//! The teacher has no pub/sub primitive to adapt — its metrics are pulled
//! via a Prometheus scrape endpoint (`metrics.rs`/`main.rs`). This module is
//! grounded in the broader corpus's push-based engine/event-channel style
//! (an `other_examples` load-test engine exposes run events over a bounded
//! channel the same way). Per spec.md §9 "Publisher back-pressure", each
//! subscriber gets a small bounded ring buffer that drops the oldest entry
//! on overflow rather than blocking the publisher tick or an unrelated
//! subscriber — a plain `tokio::sync::mpsc` can't express "drop oldest"
//! without the receiver's cooperation, so subscribers are served from a
//! `Mutex<VecDeque<_>>` woken by a `Notify` instead.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsSnapshot;
use crate::runner::TestState;
use crate::service::TestExecutionService;

/// Default publish cadence (spec.md §4.7).
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Default per-subscriber queue depth before oldest entries are dropped.
const SUBSCRIBER_CAPACITY: usize = 64;

/// A small bounded ring buffer: `send` never blocks and never fails; on
/// overflow it silently drops the oldest queued item.
struct Ring<T> {
    queue: Mutex<VecDeque<T>>,
    notify: tokio::sync::Notify,
    capacity: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: tokio::sync::Notify::new(),
            capacity,
        }
    }

    fn send(&self, item: T) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Receiving half of a [`Ring`]. Cloneable senders aren't needed since only
/// the publisher ever writes; subscribers only read.
pub struct Subscription<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Subscription<T> {
    /// Waits for the next available item. Never returns `None` — a
    /// subscription simply waits forever once its run goes terminal and
    /// stops receiving (callers drop the subscription to stop waiting).
    pub async fn recv(&mut self) -> T {
        loop {
            if let Some(item) = self.ring.queue.lock().unwrap().pop_front() {
                return item;
            }
            self.ring.notify.notified().await;
        }
    }

    /// Non-blocking poll; `None` if nothing is queued right now.
    pub fn try_recv(&mut self) -> Option<T> {
        self.ring.queue.lock().unwrap().pop_front()
    }
}

/// One of the coarse-grained lifecycle transitions a status subscriber
/// cares about (spec.md §6 `StatusEvent`). `TestState::Pending` and
/// `::Stopping` are intermediate and never produce an event of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Started,
    Stopped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub test_id: String,
    pub status: EventKind,
    pub timestamp_ms: u64,
    pub data: Option<serde_json::Value>,
}

fn event_kind_for(state: TestState) -> Option<EventKind> {
    match state {
        TestState::Running => Some(EventKind::Started),
        TestState::Stopped => Some(EventKind::Stopped),
        TestState::Completed => Some(EventKind::Completed),
        TestState::Failed => Some(EventKind::Failed),
        TestState::Pending | TestState::Stopping => None,
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fans out [`MetricsSnapshot`]s and [`StatusEvent`]s for every run tracked
/// by a [`TestExecutionService`], at a fixed cadence. One failing run's
/// delivery never blocks another's, nor the next tick (spec.md §4.7,
/// §7 "Publisher error for one run").
pub struct Publisher {
    service: Arc<TestExecutionService>,
    tick: Duration,
    metrics_subs: RwLock<HashMap<String, Vec<(u64, Arc<Ring<MetricsSnapshot>>)>>>,
    status_subs: RwLock<HashMap<String, Vec<(u64, Arc<Ring<StatusEvent>>)>>>,
    last_state: Mutex<HashMap<String, TestState>>,
    next_sub_id: AtomicU64,
}

impl Publisher {
    pub fn new(service: Arc<TestExecutionService>) -> Self {
        Self::with_tick(service, DEFAULT_TICK)
    }

    pub fn with_tick(service: Arc<TestExecutionService>, tick: Duration) -> Self {
        Self {
            service,
            tick,
            metrics_subs: RwLock::new(HashMap::new()),
            status_subs: RwLock::new(HashMap::new()),
            last_state: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(0),
        }
    }

    /// Subscribes to `test_id`'s metrics snapshots. The returned
    /// subscription is independent of whether `test_id` currently exists —
    /// it simply never receives anything if it doesn't.
    pub fn subscribe(&self, test_id: &str) -> Subscription<MetricsSnapshot> {
        let ring = Arc::new(Ring::new(SUBSCRIBER_CAPACITY));
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.metrics_subs
            .write()
            .unwrap()
            .entry(test_id.to_string())
            .or_default()
            .push((id, ring.clone()));
        Subscription { ring }
    }

    pub fn subscribe_status(&self, test_id: &str) -> Subscription<StatusEvent> {
        let ring = Arc::new(Ring::new(SUBSCRIBER_CAPACITY));
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.status_subs
            .write()
            .unwrap()
            .entry(test_id.to_string())
            .or_default()
            .push((id, ring.clone()));
        Subscription { ring }
    }

    /// Runs the publish loop until `cancel` fires. Intended to be driven by
    /// a single long-lived `tokio::spawn`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => return,
            }
            self.tick_once();
        }
    }

    /// One publish cycle: snapshot + deliver metrics for every tracked run,
    /// then emit and sweep any newly-observed terminal transition. Exposed
    /// directly so tests don't need to wait on real wall-clock ticks.
    pub fn tick_once(&self) {
        for (test_id, state) in self.service.all_states() {
            self.publish_one(&test_id, state);
        }
    }

    fn publish_one(&self, test_id: &str, state: TestState) {
        if !state.is_terminal() {
            if let Some(mut snapshot) = self.service.snapshot_for(test_id) {
                snapshot.test_id = test_id.to_string();
                snapshot.active_tasks = self.service.active_tasks(test_id).unwrap_or(0) as u64;
                self.deliver_metrics(test_id, snapshot);
            }
        }

        let previous = self
            .last_state
            .lock()
            .unwrap()
            .insert(test_id.to_string(), state);
        if previous != Some(state) {
            if let Some(kind) = event_kind_for(state) {
                let data = (kind == EventKind::Failed)
                    .then(|| self.service.failure_for(test_id))
                    .flatten()
                    .map(|error| serde_json::json!({ "error": error.to_string() }));
                self.deliver_status(
                    test_id,
                    StatusEvent {
                        test_id: test_id.to_string(),
                        status: kind,
                        timestamp_ms: now_ms(),
                        data,
                    },
                );
            }
        }

        if state.is_terminal() {
            self.service.sweep(test_id);
            self.metrics_subs.write().unwrap().remove(test_id);
            self.status_subs.write().unwrap().remove(test_id);
            self.last_state.lock().unwrap().remove(test_id);
        }
    }

    fn deliver_metrics(&self, test_id: &str, snapshot: MetricsSnapshot) {
        let subs = self.metrics_subs.read().unwrap();
        let Some(subscribers) = subs.get(test_id) else {
            return;
        };
        for (_, ring) in subscribers {
            ring.send(snapshot.clone());
        }
    }

    fn deliver_status(&self, test_id: &str, event: StatusEvent) {
        let subs = self.status_subs.read().unwrap();
        let Some(subscribers) = subs.get(test_id) else {
            return;
        };
        for (_, ring) in subscribers {
            ring.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadMode, RampKind, TestConfig};
    use crate::registry::TaskRegistry;
    use std::collections::HashMap as Map;

    fn quick_config(duration_s: u64) -> TestConfig {
        TestConfig {
            task_type: "sleep".to_string(),
            task_params: {
                let mut p = Map::new();
                p.insert("duration_ms".to_string(), "1".to_string());
                p
            },
            load_mode: LoadMode::Concurrency,
            max_concurrency: 4,
            starting_concurrency: 4,
            duration_s,
            ramp_kind: RampKind::Constant,
            warmup_s: 0,
        }
    }

    #[tokio::test]
    async fn tick_delivers_a_snapshot_to_subscribers() {
        let service = Arc::new(TestExecutionService::new(Arc::new(
            TaskRegistry::with_defaults(),
        )));
        let publisher = Publisher::with_tick(service.clone(), Duration::from_millis(10));
        let id = service.start(quick_config(5)).unwrap();

        let mut sub = publisher.subscribe(&id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.tick_once();

        let snapshot = sub.try_recv();
        assert_eq!(snapshot.map(|s| s.test_id), Some(id));
    }

    #[tokio::test]
    async fn terminal_run_emits_one_status_event_and_gets_swept() {
        let service = Arc::new(TestExecutionService::new(Arc::new(
            TaskRegistry::with_defaults(),
        )));
        let publisher = Publisher::with_tick(service.clone(), Duration::from_millis(10));
        let id = service.start(quick_config(1)).unwrap();
        let mut sub = publisher.subscribe_status(&id);

        // Started.
        publisher.tick_once();
        let started = sub.try_recv();
        assert_eq!(started.map(|e| e.status), Some(EventKind::Started));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        publisher.tick_once();

        let completed = sub.try_recv();
        assert_eq!(completed.map(|e| e.status), Some(EventKind::Completed));
        assert!(completed.and_then(|e| e.data).is_none());

        // The run was swept: a second tick has nothing left to report.
        publisher.tick_once();
        assert!(service.status(&id).is_none());
    }

    #[tokio::test]
    async fn failed_run_status_event_carries_the_run_error_in_data() {
        let service = Arc::new(TestExecutionService::new(Arc::new(
            TaskRegistry::with_defaults(),
        )));
        let publisher = Publisher::with_tick(service.clone(), Duration::from_millis(10));
        let mut bad_task = quick_config(1);
        bad_task.task_type = "does-not-exist".to_string();
        let id = service.start(bad_task).unwrap();
        let mut sub = publisher.subscribe_status(&id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.tick_once();

        let failed = sub.try_recv().expect("a FAILED status event");
        assert_eq!(failed.status, EventKind::Failed);
        let data = failed.data.expect("FAILED event should carry the RunError");
        assert!(data["error"].as_str().unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn ring_drops_oldest_on_overflow() {
        let ring = Ring::new(2);
        ring.send(1);
        ring.send(2);
        ring.send(3);
        let mut sub = Subscription { ring: Arc::new(ring) };
        assert_eq!(sub.try_recv(), Some(2));
        assert_eq!(sub.try_recv(), Some(3));
        assert_eq!(sub.try_recv(), None);
    }
}
