//! Optional Prometheus exposition endpoint, alongside the push-based
//! [`crate::publisher`].
//!
//! Lifted near-verbatim from the teacher's `metrics.rs`
//! (`register_metrics`/`metrics_handler`/`start_metrics_server`), which
//! already wires a `lazy_static` registry behind a small `hyper` server.
//! What changes is *what* gets exposed: the teacher tracked HTTP-scenario
//! counters (`requests_total`, `scenario_executions_total`, ...); this
//! tracks the engine-wide counters spec.md's ambient observability section
//! calls for — total runs started/completed/failed and tasks
//! submitted/completed across every run this process has ever driven.
//! Per-run detail stays on [`crate::publisher::Publisher`]; this endpoint is
//! for a scrape-based sidecar that only cares about the process as a whole.

use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref RUNS_STARTED_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new("runs_started_total", "Total test runs started"))
            .unwrap();
    pub static ref RUNS_COMPLETED_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new(
            "runs_completed_total",
            "Total test runs that reached COMPLETED"
        ))
        .unwrap();
    pub static ref RUNS_STOPPED_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new(
            "runs_stopped_total",
            "Total test runs that reached STOPPED"
        ))
        .unwrap();
    pub static ref RUNS_FAILED_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new(
            "runs_failed_total",
            "Total test runs that reached FAILED"
        ))
        .unwrap();
    pub static ref TASKS_SUBMITTED_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new(
            "tasks_submitted_total",
            "Total tasks submitted to any executor"
        ))
        .unwrap();
    pub static ref TASKS_COMPLETED_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new(
            "tasks_completed_total",
            "Total tasks that finished executing, successfully or not"
        ))
        .unwrap();
}

/// Registers every process-wide counter with `registry`. Call once at
/// startup before serving traffic.
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(RUNS_STARTED_TOTAL.clone()))?;
    registry.register(Box::new(RUNS_COMPLETED_TOTAL.clone()))?;
    registry.register(Box::new(RUNS_STOPPED_TOTAL.clone()))?;
    registry.register(Box::new(RUNS_FAILED_TOTAL.clone()))?;
    registry.register(Box::new(TASKS_SUBMITTED_TOTAL.clone()))?;
    registry.register(Box::new(TASKS_COMPLETED_TOTAL.clone()))?;
    Ok(())
}

async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    Ok(Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap())
}

/// Serves `/metrics` on `port` until the process exits. Errors are logged,
/// not propagated — a crashed scrape endpoint shouldn't take a running test
/// down with it.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry = registry.clone();
                async move { metrics_handler(req, registry).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}
