//! Engine configuration types.
//!
//! `EngineConfig` represents the optional `engine.toml` that sets the
//! defaults applied to steps and runs which do not specify their own.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Defaults and limits for the workflow engine.
///
/// All fields have defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-attempt timeout for steps without their own `timeout`.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: f64,

    /// Whole-run timeout when neither the caller nor the workflow sets one.
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_workflow_timeout_secs: f64,

    /// Retries for steps without their own `retries`.
    #[serde(default)]
    pub default_retries: u32,

    /// Fixed pause between attempts of the same step.
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Upper bound on concurrently running parallel steps. Unbounded if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,

    /// Keep the outcomes recorded before a workflow timeout instead of
    /// returning empty maps.
    #[serde(default)]
    pub preserve_partial_on_timeout: bool,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_step_timeout_secs() -> f64 {
    300.0
}

fn default_workflow_timeout_secs() -> f64 {
    1800.0
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            default_workflow_timeout_secs: default_workflow_timeout_secs(),
            default_retries: 0,
            retry_backoff_ms: 0,
            max_parallel_steps: None,
            preserve_partial_on_timeout: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// The default step timeout, falling back to 300s if the configured
    /// value is not a valid duration.
    pub fn step_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_step_timeout_secs)
            .unwrap_or(Duration::from_secs(300))
    }

    /// The default workflow timeout, falling back to 1800s if the configured
    /// value is not a valid duration.
    pub fn workflow_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_workflow_timeout_secs)
            .unwrap_or(Duration::from_secs(1800))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
