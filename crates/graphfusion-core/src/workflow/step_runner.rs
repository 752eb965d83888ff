//! Step executor: runs one concrete step against its agent.
//!
//! Each attempt checks template resolution, looks the agent up, and invokes
//! the capability under the step timeout. Failed attempts are repeated while
//! the retry budget allows. The result is always a terminal `StepOutcome`;
//! step errors never escape this module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use graphfusion_types::config::EngineConfig;
use graphfusion_types::event::WorkflowEvent;
use graphfusion_types::workflow::{ConcreteStep, StepCompletion};
use serde_json::Value;
use uuid::Uuid;

use super::retry::RetryHandler;
use super::template::ResolvedInput;
use crate::agent::{AgentDirectory, CapabilityError};
use crate::config::resolve_step_timeout;
use crate::event::EventBus;
use crate::knowledge::BoxKnowledgeSink;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a single attempt of a step failed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("unresolved template reference(s): {}", .0.join(", "))]
    UnresolvedReference(Vec<String>),

    #[error(transparent)]
    CapabilityInvocation(#[from] CapabilityError),

    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl StepError {
    /// Missing agents and unresolved inputs fail the same way on every
    /// attempt, so they are not retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepError::AgentNotFound(_) | StepError::UnresolvedReference(_)
        )
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Terminal result of running a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(StepCompletion),
    Failed { error: String, attempts: u32 },
}

impl StepOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            StepOutcome::Completed(completion) => completion.attempts,
            StepOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed(_))
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes concrete steps. Cheap to clone; clones share the agent
/// directory, knowledge sink and event bus.
#[derive(Clone)]
pub struct StepRunner {
    agents: Arc<AgentDirectory>,
    knowledge: Option<Arc<BoxKnowledgeSink>>,
    events: EventBus,
    config: Arc<EngineConfig>,
}

impl StepRunner {
    pub fn new(
        agents: Arc<AgentDirectory>,
        knowledge: Option<Arc<BoxKnowledgeSink>>,
        events: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            agents,
            knowledge,
            events,
            config,
        }
    }

    /// Run `step` with its already-resolved input until it completes or its
    /// retry budget is exhausted.
    pub async fn run(&self, run_id: Uuid, step: &ConcreteStep, input: &ResolvedInput) -> StepOutcome {
        let start = Instant::now();
        self.events.publish(WorkflowEvent::StepStarted {
            run_id,
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            parallel: step.parallel,
        });

        let mut current = RetryHandler::with_budget(&self.config, step);
        let mut attempts = 0u32;

        let error = loop {
            attempts += 1;
            match self.attempt(&current, input).await {
                Ok(result) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    tracing::debug!(
                        run_id = %run_id,
                        step_id = %step.id,
                        attempts,
                        duration_ms,
                        "step completed"
                    );
                    self.events.publish(WorkflowEvent::StepCompleted {
                        run_id,
                        step_id: step.id.clone(),
                        attempts,
                        duration_ms,
                    });
                    self.offer_knowledge(step, &result);
                    return StepOutcome::Completed(StepCompletion {
                        result,
                        completed_at: Utc::now(),
                        attempts,
                    });
                }
                Err(err) if RetryHandler::should_retry(&current, &err) => {
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = %step.id,
                        attempt = attempts,
                        remaining = current.retries.unwrap_or(0),
                        error = %err,
                        "step attempt failed, retrying"
                    );
                    self.events.publish(WorkflowEvent::StepRetrying {
                        run_id,
                        step_id: step.id.clone(),
                        attempt: attempts,
                        error: err.to_string(),
                    });
                    current = RetryHandler::next_attempt(&current);
                    if let Some(backoff) = RetryHandler::backoff(&self.config) {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(err) => break err,
            }
        };

        let error = error.to_string();
        tracing::warn!(
            run_id = %run_id,
            step_id = %step.id,
            attempts,
            error = %error,
            "step failed"
        );
        self.events.publish(WorkflowEvent::StepFailed {
            run_id,
            step_id: step.id.clone(),
            attempts,
            error: error.clone(),
        });
        StepOutcome::Failed { error, attempts }
    }

    async fn attempt(&self, step: &ConcreteStep, input: &ResolvedInput) -> Result<Value, StepError> {
        if !input.is_complete() {
            return Err(StepError::UnresolvedReference(input.unresolved.clone()));
        }

        let agent = self
            .agents
            .get(&step.agent_id)
            .ok_or_else(|| StepError::AgentNotFound(step.agent_id.clone()))?;

        let timeout = resolve_step_timeout(&self.config, step);
        match tokio::time::timeout(timeout, agent.invoke(&step.capability, &input.values)).await {
            Ok(result) => result.map_err(StepError::from),
            Err(_elapsed) => Err(StepError::Timeout(timeout)),
        }
    }

    /// Hand the result to the knowledge sink without waiting for it.
    fn offer_knowledge(&self, step: &ConcreteStep, result: &Value) {
        let Some(sink) = &self.knowledge else {
            return;
        };
        let sink = Arc::clone(sink);
        let step_id = step.id.clone();
        let agent_id = step.agent_id.clone();
        let capability = step.capability.clone();
        let result = result.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.record(&agent_id, &capability, &result).await {
                tracing::warn!(step_id = %step_id, error = %err, "knowledge sink rejected step result");
            }
        });
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("agents", &self.agents)
            .field("knowledge", &self.knowledge.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CapabilityAgent;
    use crate::knowledge::{InMemoryKnowledgeSink, KnowledgeError, KnowledgeSink};
    use crate::workflow::context::ExecutionContext;
    use crate::workflow::template::resolve_input;
    use graphfusion_types::workflow::StepInput;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner_with(agents: AgentDirectory, config: EngineConfig) -> StepRunner {
        StepRunner::new(Arc::new(agents), None, EventBus::new(64), Arc::new(config))
    }

    fn flaky_agent(calls: Arc<AtomicU32>, succeed_on: u32) -> CapabilityAgent {
        CapabilityAgent::new("agent1", "worker").with_capability("execute", move |_| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= succeed_on {
                    Ok(json!(format!("done on attempt {n}")))
                } else {
                    Err(CapabilityError::Failed(format!("attempt {n} failed")))
                }
            }
        })
    }

    fn no_input() -> ResolvedInput {
        resolve_input(&StepInput::new(), &ExecutionContext::new())
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), 1));
        let runner = runner_with(agents, EngineConfig::default());

        let step = ConcreteStep::new("s1", "agent1", "execute");
        let outcome = runner.run(Uuid::now_v7(), &step, &no_input()).await;

        let StepOutcome::Completed(completion) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(completion.result, json!("done on attempt 1"));
        assert_eq!(completion.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), 3));
        let runner = runner_with(agents, EngineConfig::default());

        let step = ConcreteStep::new("s1", "agent1", "execute").with_retries(2);
        let outcome = runner.run(Uuid::now_v7(), &step, &no_input()).await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.attempts(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), u32::MAX));
        let runner = runner_with(agents, EngineConfig::default());

        let step = ConcreteStep::new("s1", "agent1", "execute").with_retries(2);
        let outcome = runner.run(Uuid::now_v7(), &step, &no_input()).await;

        assert_eq!(
            outcome,
            StepOutcome::Failed {
                error: "attempt 3 failed".to_string(),
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_default_retries_from_config() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), u32::MAX));
        let config = EngineConfig {
            default_retries: 1,
            ..EngineConfig::default()
        };
        let runner = runner_with(agents, config);

        let outcome = runner
            .run(Uuid::now_v7(), &ConcreteStep::new("s1", "agent1", "execute"), &no_input())
            .await;
        assert_eq!(outcome.attempts(), 2);
    }

    #[tokio::test]
    async fn test_missing_agent_not_retried() {
        let runner = runner_with(AgentDirectory::new(), EngineConfig::default());
        let step = ConcreteStep::new("s1", "ghost", "execute").with_retries(5);

        let outcome = runner.run(Uuid::now_v7(), &step, &no_input()).await;
        assert_eq!(
            outcome,
            StepOutcome::Failed {
                error: "agent 'ghost' not found".to_string(),
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails_without_invoking() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), 1));
        let runner = runner_with(agents, EngineConfig::default());

        let step = ConcreteStep::new("s1", "agent1", "execute")
            .with_input("analysis", json!("{{later}}"))
            .with_retries(3);
        let input = resolve_input(&step.input, &ExecutionContext::new());
        let outcome = runner.run(Uuid::now_v7(), &step, &input).await;

        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(outcome, StepOutcome::Failed { ref error, .. } if error.contains("later")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let mut agents = AgentDirectory::new();
        agents.register(CapabilityAgent::new("slow", "sleeper").with_capability(
            "execute",
            |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("too late"))
            },
        ));
        let runner = runner_with(agents, EngineConfig::default());
        let step = ConcreteStep::new("s1", "slow", "execute").with_timeout_secs(1.0);

        let started = tokio::time::Instant::now();
        let outcome = runner.run(Uuid::now_v7(), &step, &no_input()).await;

        assert_eq!(
            outcome,
            StepOutcome::Failed {
                error: "timed out after 1s".to_string(),
                attempts: 1
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), 3));
        let config = EngineConfig {
            retry_backoff_ms: 500,
            ..EngineConfig::default()
        };
        let runner = runner_with(agents, config);

        let started = tokio::time::Instant::now();
        let step = ConcreteStep::new("s1", "agent1", "execute").with_retries(2);
        let outcome = runner.run(Uuid::now_v7(), &step, &no_input()).await;

        assert!(outcome.is_completed());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_events_for_retry_and_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), u32::MAX));
        let runner = runner_with(agents, EngineConfig::default());
        let mut rx = runner.events.subscribe();

        let step = ConcreteStep::new("s1", "agent1", "execute").with_retries(1);
        runner.run(Uuid::now_v7(), &step, &no_input()).await;

        assert!(matches!(rx.try_recv().unwrap(), WorkflowEvent::StepStarted { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkflowEvent::StepRetrying { attempt: 1, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkflowEvent::StepFailed { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_result_offered_to_knowledge_sink() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), 1));
        let sink = InMemoryKnowledgeSink::new();
        let runner = StepRunner::new(
            Arc::new(agents),
            Some(Arc::new(BoxKnowledgeSink::new(sink.clone()))),
            EventBus::new(16),
            Arc::new(EngineConfig::default()),
        );

        let step = ConcreteStep::new("s1", "agent1", "execute");
        runner.run(Uuid::now_v7(), &step, &no_input()).await;

        for _ in 0..10 {
            if !sink.records().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent_id, "agent1");
        assert_eq!(records[0].capability, "execute");
    }

    struct BrokenSink;

    impl KnowledgeSink for BrokenSink {
        async fn record(&self, _: &str, _: &str, _: &Value) -> Result<(), KnowledgeError> {
            Err(KnowledgeError::Unavailable("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_knowledge_sink_failure_does_not_fail_step() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentDirectory::new();
        agents.register(flaky_agent(Arc::clone(&calls), 1));
        let runner = StepRunner::new(
            Arc::new(agents),
            Some(Arc::new(BoxKnowledgeSink::new(BrokenSink))),
            EventBus::new(16),
            Arc::new(EngineConfig::default()),
        );

        let outcome = runner
            .run(Uuid::now_v7(), &ConcreteStep::new("s1", "agent1", "execute"), &no_input())
            .await;
        assert!(outcome.is_completed());
    }
}
