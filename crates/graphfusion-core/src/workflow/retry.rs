//! Retry policy for step execution.
//!
//! Stateless: each decision takes the step (whose `retries` field is the
//! remaining budget) and the error of the attempt that just failed. A
//! re-attempt runs a derived copy of the step with one retry fewer.

use std::time::Duration;

use graphfusion_types::config::EngineConfig;
use graphfusion_types::workflow::ConcreteStep;

use super::step_runner::StepError;
use crate::config::resolve_retries;

pub struct RetryHandler;

impl RetryHandler {
    /// Pin the step's retry budget, filling in the engine default.
    pub fn with_budget(config: &EngineConfig, step: &ConcreteStep) -> ConcreteStep {
        let retries = resolve_retries(config, step);
        step.clone().with_retries(retries)
    }

    /// Whether the attempt that failed with `error` should be repeated.
    pub fn should_retry(step: &ConcreteStep, error: &StepError) -> bool {
        error.is_retryable() && step.retries.unwrap_or(0) > 0
    }

    /// The step for the next attempt: identical, with one retry fewer.
    pub fn next_attempt(step: &ConcreteStep) -> ConcreteStep {
        let remaining = step.retries.unwrap_or(0).saturating_sub(1);
        step.clone().with_retries(remaining)
    }

    /// Pause between attempts.
    pub fn backoff(config: &EngineConfig) -> Option<Duration> {
        let backoff = config.retry_backoff();
        (!backoff.is_zero()).then_some(backoff)
    }
}
