//! Standalone driver: reads a `TestConfig` from environment variables
//! (the teacher's style in the original `main.rs`, minus the HTTP-specific
//! variables it no longer needs), runs it to completion against the
//! execution engine, and prints periodic status plus a final summary.
//!
//! This is a thin CLI shell over [`loadgen_engine`] — everything it does
//! (start a run, poll its status, wait for a terminal state) is also how
//! an external HTTP control surface would drive the engine, were one in
//! scope.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use prometheus::Registry;
use tokio::time::Duration;
use tracing::info;

use loadgen_engine::config::{LoadMode, RampKind, TestConfig};
use loadgen_engine::metrics_server;
use loadgen_engine::registry::TaskRegistry;
use loadgen_engine::service::TestExecutionService;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{key} must be a valid value: {e}")),
        Err(_) => default,
    }
}

/// Builds the task's parameter map from every `TASK_PARAM_<NAME>` variable
/// in the environment, e.g. `TASK_PARAM_URL=https://example.com` becomes
/// `{"url": "https://example.com"}`.
fn task_params_from_env() -> HashMap<String, String> {
    const PREFIX: &str = "TASK_PARAM_";
    env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(PREFIX)
                .map(|name| (name.to_lowercase(), value))
        })
        .collect()
}

fn ramp_kind_from_env() -> RampKind {
    match env_or("RAMP_KIND", "constant").to_lowercase().as_str() {
        "linear" => RampKind::Linear {
            ramp_seconds: parse_env("RAMP_SECONDS", 30.0),
        },
        "step" => RampKind::Step {
            step: parse_env("RAMP_STEP", 10),
            interval_seconds: parse_env("RAMP_INTERVAL_SECONDS", 10.0),
        },
        "constant" => RampKind::Constant,
        other => panic!("unknown RAMP_KIND '{other}', use 'linear', 'step', or 'constant'"),
    }
}

fn load_mode_from_env() -> LoadMode {
    match env::var("TARGET_TPS") {
        Ok(raw) => LoadMode::Rate {
            target_tps: raw
                .parse()
                .unwrap_or_else(|e| panic!("TARGET_TPS must be a number: {e}")),
            rate_ramp_seconds: parse_env("RATE_RAMP_SECONDS", 0.0),
        },
        Err(_) => LoadMode::Concurrency,
    }
}

fn config_from_env() -> TestConfig {
    TestConfig {
        task_type: env_or("TASK_TYPE", "sleep"),
        task_params: task_params_from_env(),
        load_mode: load_mode_from_env(),
        max_concurrency: parse_env("MAX_CONCURRENCY", 50),
        starting_concurrency: parse_env("STARTING_CONCURRENCY", 10),
        duration_s: parse_env("TEST_DURATION_SECONDS", 60),
        ramp_kind: ramp_kind_from_env(),
        warmup_s: parse_env("WARMUP_SECONDS", 0),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();

    let prometheus_registry = Registry::new();
    metrics_server::register_metrics(&prometheus_registry)?;
    if let Ok(port) = env::var("METRICS_PORT") {
        let port: u16 = port.parse().expect("METRICS_PORT must be a u16");
        let registry = Arc::new(Mutex::new(prometheus_registry));
        tokio::spawn(metrics_server::start_metrics_server(port, registry));
    }

    let config = config_from_env();
    info!(
        task_type = %config.task_type,
        load_mode = ?config.load_mode,
        max_concurrency = config.max_concurrency,
        duration_s = config.duration_s,
        "starting load test"
    );

    let service = TestExecutionService::new(Arc::new(TaskRegistry::with_defaults()));
    let test_id = service.start(config)?;
    info!(test_id = %test_id, "test started");

    let final_status = loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let Some(status) = service.status(&test_id) else {
            // The run was already swept; nothing left to poll.
            break None;
        };
        info!(
            test_id = %test_id,
            status = ?status.status,
            elapsed_seconds = status.elapsed_seconds,
            total_requests = status.current_metrics.total_requests,
            success_rate = status.current_metrics.success_rate,
            current_tps = status.current_metrics.current_tps,
            "test progress"
        );
        if status.status.is_terminal() {
            break Some(status);
        }
    };

    match final_status {
        Some(status) => {
            info!(
                test_id = %test_id,
                status = ?status.status,
                total_requests = status.current_metrics.total_requests,
                successful_requests = status.current_metrics.successful_requests,
                failed_requests = status.current_metrics.failed_requests,
                p50_ms = status.current_metrics.latency_percentiles.p50,
                p99_ms = status.current_metrics.latency_percentiles.p99,
                "test finished"
            );
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        None => info!(test_id = %test_id, "test finished"),
    }

    Ok(())
}
