//! `TestConfig`: the programmatically-constructed description of a single
//! test run (spec.md §3, §6 validation ranges).
//!
//! Unlike the teacher's `Config`, this is never sourced from environment
//! variables or files — the layer that would parse a YAML/env front-end
//! into a `TestConfig` is out of scope (spec.md §1). `validate()` keeps the
//! teacher's `ConfigError`/range-checking style, generalized from HTTP
//! client settings to the REST wire-contract ranges in spec.md §6.

use thiserror::Error;

use crate::ramp::RampStrategy;
use crate::task::TaskParams;

/// Configuration errors, surfaced synchronously to the caller of
/// `TestExecutionService::start` before any run state is created
/// (spec.md §7 "Validation").
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be >= {min}, got {actual}")]
    TooSmall {
        field: &'static str,
        min: f64,
        actual: f64,
    },

    #[error("{field} must be <= {max}, got {actual}")]
    TooLarge {
        field: &'static str,
        max: f64,
        actual: f64,
    },

    #[error("starting_concurrency ({starting}) must be <= max_concurrency ({max})")]
    StartingExceedsMax { starting: u32, max: u32 },

    #[error("ramp strategy '{strategy}' requires {field} > 0")]
    InvalidRampParam {
        strategy: &'static str,
        field: &'static str,
    },

    #[error("task_type must not be empty")]
    EmptyTaskType,
}

/// Whether a run is paced by a target rate or is concurrency-only (spec.md
/// §9 Open Question (c)): adopted as an explicit enum rather than an
/// `Option<f64>` sentinel, mirroring the teacher's `LoadModel` enum.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoadMode {
    /// No rate cap; concurrency alone (via the ramp strategy) governs
    /// throughput.
    Concurrency,
    /// Paced by the rate controller at `target_tps`, optionally ramping
    /// from 1 to `target_tps` over `rate_ramp_seconds` (0 disables ramping;
    /// spec.md §4.1).
    Rate {
        target_tps: f64,
        rate_ramp_seconds: f64,
    },
}

/// The concurrency ramp shape (spec.md §4.2), paired with the
/// `starting_concurrency`/`max_concurrency` bounds carried on `TestConfig`
/// to produce a fully-specified [`RampStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RampKind {
    Linear { ramp_seconds: f64 },
    Step { step: u32, interval_seconds: f64 },
    Constant,
}

/// Everything needed to run one test (spec.md §3 `TestConfig`). Immutable
/// once constructed; validated once, up front, via [`TestConfig::validate`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct TestConfig {
    pub task_type: String,
    pub task_params: TaskParams,
    pub load_mode: LoadMode,
    pub max_concurrency: u32,
    pub starting_concurrency: u32,
    pub duration_s: u64,
    pub ramp_kind: RampKind,
    pub warmup_s: u64,
}

impl TestConfig {
    /// Enforces the REST wire-contract validation ranges from spec.md §6:
    /// `target_tps ∈ [1, 100_000]`, `max_concurrency ∈ [1, 50_000]`,
    /// `test_duration_seconds ≥ 1`, `warmup_seconds ≥ 0`,
    /// `starting_concurrency ∈ [1, max_concurrency]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_type.trim().is_empty() {
            return Err(ConfigError::EmptyTaskType);
        }

        if self.max_concurrency < 1 {
            return Err(ConfigError::TooSmall {
                field: "max_concurrency",
                min: 1.0,
                actual: self.max_concurrency as f64,
            });
        }
        if self.max_concurrency > 50_000 {
            return Err(ConfigError::TooLarge {
                field: "max_concurrency",
                max: 50_000.0,
                actual: self.max_concurrency as f64,
            });
        }

        if self.starting_concurrency < 1 {
            return Err(ConfigError::TooSmall {
                field: "starting_concurrency",
                min: 1.0,
                actual: self.starting_concurrency as f64,
            });
        }
        if self.starting_concurrency > self.max_concurrency {
            return Err(ConfigError::StartingExceedsMax {
                starting: self.starting_concurrency,
                max: self.max_concurrency,
            });
        }

        if self.duration_s < 1 {
            return Err(ConfigError::TooSmall {
                field: "duration_s",
                min: 1.0,
                actual: self.duration_s as f64,
            });
        }

        // warmup_s >= 0 is enforced by the type (u64); nothing to check.

        if let LoadMode::Rate { target_tps, .. } = self.load_mode {
            if target_tps < 1.0 {
                return Err(ConfigError::TooSmall {
                    field: "target_tps",
                    min: 1.0,
                    actual: target_tps,
                });
            }
            if target_tps > 100_000.0 {
                return Err(ConfigError::TooLarge {
                    field: "target_tps",
                    max: 100_000.0,
                    actual: target_tps,
                });
            }
        }

        match self.ramp_kind {
            RampKind::Linear { ramp_seconds } if ramp_seconds <= 0.0 => {
                return Err(ConfigError::InvalidRampParam {
                    strategy: "linear",
                    field: "ramp_seconds",
                })
            }
            RampKind::Step {
                step,
                interval_seconds,
            } => {
                if step == 0 {
                    return Err(ConfigError::InvalidRampParam {
                        strategy: "step",
                        field: "step",
                    });
                }
                if interval_seconds <= 0.0 {
                    return Err(ConfigError::InvalidRampParam {
                        strategy: "step",
                        field: "interval_seconds",
                    });
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Builds the [`RampStrategy`] this config describes, pairing
    /// `ramp_kind` with the configured concurrency bounds.
    pub fn ramp_strategy(&self) -> RampStrategy {
        match self.ramp_kind {
            RampKind::Linear { ramp_seconds } => RampStrategy::Linear {
                start: self.starting_concurrency,
                max: self.max_concurrency,
                ramp_seconds,
            },
            RampKind::Step {
                step,
                interval_seconds,
            } => RampStrategy::Step {
                start: self.starting_concurrency,
                max: self.max_concurrency,
                step,
                interval_seconds,
            },
            RampKind::Constant => RampStrategy::Constant {
                max: self.max_concurrency,
            },
        }
    }
}
