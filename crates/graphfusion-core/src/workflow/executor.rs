//! Workflow coordinator: round-based execution of a step DAG.
//!
//! Each round the scheduler hands back the steps whose dependencies have all
//! completed. Parallel steps are spawned onto a `tokio::JoinSet`; serial steps
//! run one after another alongside that batch. The round ends once every
//! dispatched step is terminal, and only then are outcomes written back. The
//! coordinator is the single writer of the context and the outcome maps.
//!
//! The whole round loop runs under the workflow deadline. When it elapses the
//! loop future is dropped, which aborts every task still in the `JoinSet`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use graphfusion_types::config::EngineConfig;
use graphfusion_types::event::WorkflowEvent;
use graphfusion_types::workflow::{
    ConcreteStep, RunPhase, StepCompletion, WorkflowResult, WorkflowSpec, WorkflowStatus,
};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::definition::{WorkflowError, check_step_ids, load_workflow_file};
use super::scheduler::{Round, Scheduler};
use super::step_runner::{StepOutcome, StepRunner};
use super::template::resolve_input;
use crate::agent::AgentDirectory;
use crate::event::EventBus;
use crate::knowledge::{BoxKnowledgeSink, KnowledgeSink};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Run-level failures. Step failures are never reported here; they land in
/// `WorkflowResult::failed`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Steps remain pending but none can ever become eligible.
    #[error("workflow deadlock: no runnable steps among pending [{}]", .pending.join(", "))]
    Deadlock { pending: Vec<String> },

    /// The workflow could not be loaded or has duplicate step ids.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// A step task panicked or was cancelled outside the engine's control.
    #[error("step task failed to join: {0}")]
    TaskJoin(String),
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

struct RunState {
    run_id: Uuid,
    phase: RunPhase,
    context: ExecutionContext,
    completed: BTreeMap<String, StepCompletion>,
    failed: BTreeMap<String, String>,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phase: RunPhase::Building,
            context: ExecutionContext::new(),
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    fn transition(&mut self, next: RunPhase) {
        tracing::debug!(run_id = %self.run_id, from = ?self.phase, to = ?next, "run phase changed");
        self.phase = next;
    }

    fn record(&mut self, step_id: String, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Completed(completion) => {
                self.context.insert(&step_id, completion.result.clone());
                self.completed.insert(step_id, completion);
            }
            StepOutcome::Failed { error, .. } => {
                self.failed.insert(step_id, error);
            }
        }
    }

    fn finish(mut self) -> WorkflowResult {
        let status =
            WorkflowStatus::from_outcomes(!self.completed.is_empty(), !self.failed.is_empty());
        self.transition(status.into());
        WorkflowResult::finished(self.run_id, self.completed, self.failed)
    }

    fn time_out(mut self, preserve_partial: bool) -> WorkflowResult {
        self.transition(RunPhase::TimedOut);
        if preserve_partial {
            WorkflowResult::timed_out(self.run_id, self.completed, self.failed)
        } else {
            WorkflowResult::timed_out(self.run_id, BTreeMap::new(), BTreeMap::new())
        }
    }
}

// ---------------------------------------------------------------------------
// Round dispatch
// ---------------------------------------------------------------------------

/// Per-run handle used to dispatch the steps of one round.
struct Dispatcher {
    runner: StepRunner,
    run_id: Uuid,
    parallel_limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    async fn run_round(
        &self,
        steps: Vec<ConcreteStep>,
        context: &ExecutionContext,
    ) -> Result<Vec<(String, StepOutcome)>, EngineError> {
        let (parallel, serial): (Vec<_>, Vec<_>) = steps.into_iter().partition(|s| s.parallel);

        let (parallel_outcomes, serial_outcomes) = tokio::join!(
            self.run_parallel(parallel, context),
            self.run_serial(serial, context)
        );

        let mut outcomes = serial_outcomes;
        outcomes.extend(parallel_outcomes?);
        Ok(outcomes)
    }

    async fn run_parallel(
        &self,
        steps: Vec<ConcreteStep>,
        context: &ExecutionContext,
    ) -> Result<Vec<(String, StepOutcome)>, EngineError> {
        let mut join_set = JoinSet::new();

        for step in steps {
            let input = resolve_input(&step.input, context);
            let runner = self.runner.clone();
            let limit = self.parallel_limit.clone();
            let run_id = self.run_id;

            join_set.spawn(async move {
                let _permit = match limit {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let outcome = runner.run(run_id, &step, &input).await;
                (step.id, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            let (step_id, outcome) = joined.map_err(|e| EngineError::TaskJoin(e.to_string()))?;
            outcomes.push((step_id, outcome));
        }
        Ok(outcomes)
    }

    async fn run_serial(
        &self,
        steps: Vec<ConcreteStep>,
        context: &ExecutionContext,
    ) -> Vec<(String, StepOutcome)> {
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            let input = resolve_input(&step.input, context);
            let outcome = self.runner.run(self.run_id, &step, &input).await;
            outcomes.push((step.id, outcome));
        }
        outcomes
    }
}

// ---------------------------------------------------------------------------
// WorkflowCoordinator
// ---------------------------------------------------------------------------

/// Drives workflow runs against a fixed set of agents.
pub struct WorkflowCoordinator {
    agents: Arc<AgentDirectory>,
    knowledge: Option<Arc<BoxKnowledgeSink>>,
    config: Arc<EngineConfig>,
    events: EventBus,
}

impl WorkflowCoordinator {
    pub fn new(agents: AgentDirectory, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            agents: Arc::new(agents),
            knowledge: None,
            config: Arc::new(config),
            events,
        }
    }

    /// Offer every successful step result to `sink`.
    pub fn with_knowledge_sink<K: KnowledgeSink + 'static>(mut self, sink: K) -> Self {
        self.knowledge = Some(Arc::new(BoxKnowledgeSink::new(sink)));
        self
    }

    pub fn agents(&self) -> &AgentDirectory {
        &self.agents
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Load a workflow file and execute it.
    pub async fn execute_workflow_file(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<WorkflowResult, EngineError> {
        let spec = load_workflow_file(path)?;
        self.execute_workflow(&spec, timeout).await
    }

    /// Execute `spec` to completion or until the deadline elapses.
    ///
    /// The deadline is `timeout` if given, else the workflow's own `timeout`,
    /// else the engine default. Step ids must be unique across the whole
    /// tree. Besides duplicate or blank ids, only a deadlock or a step task
    /// that fails to join produce an `Err`; everything else is reported in the
    /// result.
    pub async fn execute_workflow(
        &self,
        spec: &WorkflowSpec,
        timeout: Option<Duration>,
    ) -> Result<WorkflowResult, EngineError> {
        check_step_ids(spec)?;

        let run_id = Uuid::now_v7();
        let deadline = timeout
            .or_else(|| spec.timeout())
            .unwrap_or_else(|| self.config.workflow_timeout());

        let mut state = RunState::new(run_id);
        let mut scheduler = Scheduler::new(spec.steps.clone());
        let dispatcher = Dispatcher {
            runner: StepRunner::new(
                Arc::clone(&self.agents),
                self.knowledge.clone(),
                self.events.clone(),
                Arc::clone(&self.config),
            ),
            run_id,
            parallel_limit: self
                .config
                .max_parallel_steps
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
        };

        self.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_name: spec.name.clone(),
            step_count: spec.declared_ids().len(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = spec.name.as_str(),
            timeout_secs = deadline.as_secs_f64(),
            "starting workflow execution"
        );

        let start = Instant::now();
        state.transition(RunPhase::Running);

        let outcome = tokio::time::timeout(
            deadline,
            self.run_rounds(&dispatcher, &mut scheduler, &mut state),
        )
        .await;

        let result = match outcome {
            Ok(Ok(())) => state.finish(),
            Ok(Err(err)) => {
                state.transition(RunPhase::Failed);
                tracing::error!(run_id = %run_id, error = %err, "workflow aborted");
                self.publish_finished(
                    run_id,
                    WorkflowStatus::Failed,
                    state.completed.len(),
                    state.failed.len(),
                    start,
                );
                return Err(err);
            }
            Err(_elapsed) => {
                tracing::warn!(
                    run_id = %run_id,
                    timeout_secs = deadline.as_secs_f64(),
                    completed = state.completed.len(),
                    failed = state.failed.len(),
                    "workflow timed out"
                );
                state.time_out(self.config.preserve_partial_on_timeout)
            }
        };

        tracing::info!(
            run_id = %run_id,
            status = %result.status,
            completed = result.completed.len(),
            failed = result.failed.len(),
            "workflow finished"
        );
        self.publish_finished(
            run_id,
            result.status,
            result.completed.len(),
            result.failed.len(),
            start,
        );
        Ok(result)
    }

    async fn run_rounds(
        &self,
        dispatcher: &Dispatcher,
        scheduler: &mut Scheduler,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        let run_id = state.run_id;
        let mut round_index = 0usize;

        while !scheduler.is_finished() {
            let Round {
                executable,
                branches,
                dropped,
            } = scheduler.next_round(&state.context, &state.failed);

            for branch in branches {
                self.events.publish(WorkflowEvent::BranchSelected {
                    run_id,
                    step_id: branch.step_id,
                    taken: branch.taken,
                    steps: branch.spliced,
                });
            }
            for step in dropped {
                self.events.publish(WorkflowEvent::StepDropped {
                    run_id,
                    step_id: step.step_id,
                    blocked_by: step.blocked_by,
                });
            }

            if executable.is_empty() {
                if scheduler.is_finished() {
                    break;
                }
                let pending = scheduler.pending_ids();
                tracing::error!(run_id = %run_id, pending = ?pending, "no runnable steps remain");
                return Err(EngineError::Deadlock { pending });
            }

            tracing::debug!(
                run_id = %run_id,
                round = round_index,
                steps = executable.len(),
                "processing round"
            );

            let outcomes = dispatcher.run_round(executable, &state.context).await?;
            for (step_id, outcome) in outcomes {
                state.record(step_id, outcome);
            }
            round_index += 1;
        }

        Ok(())
    }

    fn publish_finished(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        completed: usize,
        failed: usize,
        start: Instant,
    ) {
        self.events.publish(WorkflowEvent::RunFinished {
            run_id,
            status,
            completed,
            failed,
            duration_ms: start.elapsed().as_millis() as u64,
        });
    }
}

impl std::fmt::Debug for WorkflowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCoordinator")
            .field("agents", &self.agents)
            .field("knowledge", &self.knowledge.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CapabilityAgent, CapabilityError};
    use crate::knowledge::{InMemoryKnowledgeSink, KnowledgeError};
    use graphfusion_types::workflow::{ConditionalStep, StepSpec};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Agent with `echo` (returns its input), `fail` (always errors) and
    /// `slow` (sleeps for `input.secs` seconds).
    fn worker(id: &str) -> CapabilityAgent {
        CapabilityAgent::new(id, "worker")
            .with_capability("echo", |params| async move { Ok(Value::Object(params)) })
            .with_capability("fail", |_| async {
                Err(CapabilityError::Failed("capability exploded".to_string()))
            })
            .with_capability("slow", |params| async move {
                let secs = params.get("secs").and_then(Value::as_f64).unwrap_or(10.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(json!("slow done"))
            })
    }

    fn coordinator() -> WorkflowCoordinator {
        let mut agents = AgentDirectory::new();
        agents.register(worker("agent1"));
        WorkflowCoordinator::new(agents, EngineConfig::default())
    }

    fn echo(id: &str) -> ConcreteStep {
        ConcreteStep::new(id, "agent1", "echo").with_input("step", json!(id))
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_dependent_runs_after_both_dependencies() {
        let spec = WorkflowSpec::new(
            "scenario_a",
            vec![
                echo("s1").into(),
                echo("s2").into(),
                echo("s3").with_depends_on(["s1", "s2"]).into(),
            ],
        );
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();

        let result = coordinator.execute_workflow(&spec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.failed.is_empty());
        assert_eq!(result.completed.len(), 3);

        let started: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepStarted { step_id, .. } => Some(step_id),
                _ => None,
            })
            .collect();
        assert_eq!(started.last().map(String::as_str), Some("s3"));
    }

    #[tokio::test]
    async fn test_template_reference_resolves_to_dependency_result() {
        let spec = WorkflowSpec::new(
            "templates",
            vec![
                echo("gather").into(),
                ConcreteStep::new("report", "agent1", "echo")
                    .with_input("source", json!("{{ gather }}"))
                    .with_input("title", json!("Report on {{gather}}"))
                    .with_depends_on(["gather"])
                    .into(),
            ],
        );
        let result = coordinator().execute_workflow(&spec, None).await.unwrap();

        let report = &result.completed["report"].result;
        assert_eq!(report["source"], json!({"step": "gather"}));
        assert_eq!(report["title"], json!("Report on {{gather}}"));
    }

    #[tokio::test]
    async fn test_conditional_takes_then_branch() {
        let spec = WorkflowSpec::new(
            "scenario_b",
            vec![
                ConditionalStep::new("cond", "1 == 1")
                    .with_then(vec![echo("t").into()])
                    .with_else(vec![echo("f").into()])
                    .into(),
            ],
        );
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let result = coordinator.execute_workflow(&spec, None).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.completed.contains_key("t"));
        assert!(!result.completed.contains_key("f"));
        assert!(!result.failed.contains_key("f"));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            WorkflowEvent::BranchSelected { taken: true, step_id, .. } if step_id == "cond"
        )));
    }

    #[tokio::test]
    async fn test_condition_reads_dependency_result() {
        let spec = WorkflowSpec::new(
            "branch_on_result",
            vec![
                echo("score").with_input("value", json!(0.9)).into(),
                ConditionalStep::new("cond", "score.value > 0.5 and score.step == 'score'")
                    .with_depends_on(["score"])
                    .with_then(vec![echo("high").into()])
                    .with_else(vec![echo("low").into()])
                    .into(),
            ],
        );
        let result = coordinator().execute_workflow(&spec, None).await.unwrap();
        assert!(result.completed.contains_key("high"));
        assert!(!result.completed.contains_key("low"));
    }

    #[tokio::test]
    async fn test_condition_error_takes_else_branch() {
        let spec = WorkflowSpec::new(
            "bad_condition",
            vec![
                ConditionalStep::new("cond", "undefined_step > 3")
                    .with_then(vec![echo("t").into()])
                    .with_else(vec![echo("f").into()])
                    .into(),
            ],
        );
        let result = coordinator().execute_workflow(&spec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.completed.contains_key("f"));
        assert!(!result.completed.contains_key("t"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_drop_dependent() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let mut agents = AgentDirectory::new();
        agents.register(worker("agent1"));
        agents.register(CapabilityAgent::new("flaky", "worker").with_capability(
            "execute",
            move |_| {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(CapabilityError::Failed("still broken".to_string()))
                }
            },
        ));
        let coordinator = WorkflowCoordinator::new(agents, EngineConfig::default());
        let spec = WorkflowSpec::new(
            "scenario_c",
            vec![
                ConcreteStep::new("a", "flaky", "execute").with_retries(2).into(),
                echo("b").with_depends_on(["a"]).into(),
                echo("c").into(),
            ],
        );
        let mut rx = coordinator.subscribe();

        let result = coordinator.execute_workflow(&spec, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.status, WorkflowStatus::Partial);
        assert_eq!(result.failed.get("a").map(String::as_str), Some("still broken"));
        assert!(!result.completed.contains_key("b"));
        assert!(!result.failed.contains_key("b"));
        assert!(result.completed.contains_key("c"));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            WorkflowEvent::StepDropped { step_id, blocked_by, .. } if step_id == "b" && blocked_by == "a"
        )));
    }

    #[tokio::test]
    async fn test_only_failures_is_failed_status() {
        let spec = WorkflowSpec::new(
            "all_fail",
            vec![ConcreteStep::new("a", "agent1", "fail").into()],
        );
        let result = coordinator().execute_workflow(&spec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.completed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent_fails_without_retry() {
        let spec = WorkflowSpec::new(
            "missing_agent",
            vec![ConcreteStep::new("a", "nobody", "execute").with_retries(3).into()],
        );
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let result = coordinator.execute_workflow(&spec, None).await.unwrap();

        assert_eq!(result.failed["a"], "agent 'nobody' not found");
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorkflowEvent::StepRetrying { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_step() {
        let spec = WorkflowSpec::new(
            "scenario_d",
            vec![
                ConcreteStep::new("slow", "agent1", "slow")
                    .with_input("secs", json!(10))
                    .with_timeout_secs(1.0)
                    .into(),
            ],
        );
        let started = tokio::time::Instant::now();
        let result = coordinator().execute_workflow(&spec, None).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.failed["slow"], "timed out after 1s");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_discards_progress() {
        let spec = WorkflowSpec::new(
            "scenario_e",
            vec![
                echo("quick").into(),
                ConcreteStep::new("slow", "agent1", "slow")
                    .with_input("secs", json!(30))
                    .with_depends_on(["quick"])
                    .into(),
            ],
        );
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let result = coordinator
            .execute_workflow(&spec, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Timeout);
        assert!(result.completed.is_empty());
        assert!(result.failed.is_empty());
        assert!(matches!(
            drain(&mut rx).last(),
            Some(WorkflowEvent::RunFinished {
                status: WorkflowStatus::Timeout,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_from_definition() {
        let spec = WorkflowSpec::new(
            "own_deadline",
            vec![ConcreteStep::new("slow", "agent1", "slow").with_input("secs", json!(30)).into()],
        )
        .with_timeout_secs(2.0);

        let started = tokio::time::Instant::now();
        let result = coordinator().execute_workflow(&spec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_preserves_progress_when_configured() {
        let mut agents = AgentDirectory::new();
        agents.register(worker("agent1"));
        let config = EngineConfig {
            preserve_partial_on_timeout: true,
            ..EngineConfig::default()
        };
        let coordinator = WorkflowCoordinator::new(agents, config);
        let spec = WorkflowSpec::new(
            "keep_progress",
            vec![
                echo("quick").into(),
                ConcreteStep::new("slow", "agent1", "slow")
                    .with_input("secs", json!(30))
                    .with_depends_on(["quick"])
                    .into(),
            ],
        );

        let result = coordinator
            .execute_workflow(&spec, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Timeout);
        assert!(result.completed.contains_key("quick"));
        assert!(!result.completed.contains_key("slow"));
    }

    #[tokio::test]
    async fn test_cycle_is_deadlock() {
        let spec = WorkflowSpec::new(
            "cyclic",
            vec![
                echo("a").with_depends_on(["b"]).into(),
                echo("b").with_depends_on(["a"]).into(),
            ],
        );
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();

        let err = coordinator.execute_workflow(&spec, None).await.unwrap_err();
        match err {
            EngineError::Deadlock { pending } => assert_eq!(pending, vec!["a", "b"]),
            other => panic!("expected deadlock, got {other:?}"),
        }
        assert!(matches!(
            drain(&mut rx).last(),
            Some(WorkflowEvent::RunFinished {
                status: WorkflowStatus::Failed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_deadlock() {
        let spec = WorkflowSpec::new("dangling", vec![echo("a").with_depends_on(["ghost"]).into()]);
        let err = coordinator().execute_workflow(&spec, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Deadlock { .. }));
        assert!(err.to_string().ends_with("[a]"));
    }

    #[tokio::test]
    async fn test_events_in_order_for_simple_run() {
        let spec = WorkflowSpec::new(
            "ordered",
            vec![echo("first").into(), echo("second").with_depends_on(["first"]).into()],
        );
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let result = coordinator.execute_workflow(&spec, None).await.unwrap();

        let kinds: Vec<&'static str> = drain(&mut rx)
            .iter()
            .map(|e| {
                assert_eq!(e.run_id(), result.run_id);
                match e {
                    WorkflowEvent::RunStarted { .. } => "run_started",
                    WorkflowEvent::StepStarted { .. } => "step_started",
                    WorkflowEvent::StepCompleted { .. } => "step_completed",
                    WorkflowEvent::RunFinished { .. } => "run_finished",
                    _ => "other",
                }
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "run_finished"
            ]
        );
    }

    #[tokio::test]
    async fn test_knowledge_sink_receives_results() {
        let sink = InMemoryKnowledgeSink::new();
        let coordinator = coordinator().with_knowledge_sink(sink.clone());
        let spec = WorkflowSpec::new("knowledge", vec![echo("a").into(), echo("b").into()]);

        coordinator.execute_workflow(&spec, None).await.unwrap();
        for _ in 0..20 {
            if sink.records().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.records_for("agent1").len(), 2);
    }

    struct RejectingSink;

    impl KnowledgeSink for RejectingSink {
        async fn record(&self, _: &str, _: &str, _: &Value) -> Result<(), KnowledgeError> {
            Err(KnowledgeError::Rejected("read only".to_string()))
        }
    }

    #[tokio::test]
    async fn test_knowledge_sink_failure_is_not_fatal() {
        let coordinator = coordinator().with_knowledge_sink(RejectingSink);
        let spec = WorkflowSpec::new("knowledge", vec![echo("a").into()]);
        let result = coordinator.execute_workflow(&spec, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_steps_overlap() {
        let spec = WorkflowSpec::new(
            "fan_out",
            vec![
                ConcreteStep::new("p1", "agent1", "slow")
                    .with_input("secs", json!(3))
                    .with_parallel(true)
                    .into(),
                ConcreteStep::new("p2", "agent1", "slow")
                    .with_input("secs", json!(3))
                    .with_parallel(true)
                    .into(),
                ConcreteStep::new("s1", "agent1", "slow")
                    .with_input("secs", json!(3))
                    .into(),
            ],
        );
        let started = tokio::time::Instant::now();
        let result = coordinator().execute_workflow(&spec, None).await.unwrap();

        assert_eq!(result.completed.len(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_steps_run_one_after_another() {
        let spec = WorkflowSpec::new(
            "serial",
            vec![
                ConcreteStep::new("s1", "agent1", "slow").with_input("secs", json!(2)).into(),
                ConcreteStep::new("s2", "agent1", "slow").with_input("secs", json!(2)).into(),
            ],
        );
        let started = tokio::time::Instant::now();
        coordinator().execute_workflow(&spec, None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_parallel_steps_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(Mutex::new(0usize));
        let (active_c, peak_c) = (Arc::clone(&active), Arc::clone(&peak));

        let mut agents = AgentDirectory::new();
        agents.register(CapabilityAgent::new("tracked", "worker").with_capability(
            "execute",
            move |_| {
                let active = Arc::clone(&active_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    {
                        let mut peak = peak.lock().unwrap();
                        *peak = (*peak).max(now);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            },
        ));
        let config = EngineConfig {
            max_parallel_steps: Some(2),
            ..EngineConfig::default()
        };
        let coordinator = WorkflowCoordinator::new(agents, config);
        let steps: Vec<StepSpec> = (0..5)
            .map(|i| {
                ConcreteStep::new(format!("p{i}"), "tracked", "execute")
                    .with_parallel(true)
                    .into()
            })
            .collect();

        let result = coordinator
            .execute_workflow(&WorkflowSpec::new("bounded", steps), None)
            .await
            .unwrap();
        assert_eq!(result.completed.len(), 5);
        assert_eq!(*peak.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_execute_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            "name: from_file\nsteps:\n  - id: a\n    agent_id: agent1\n    capability: echo\n",
        )
        .unwrap();

        let result = coordinator().execute_workflow_file(&path, None).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);

        let missing = coordinator()
            .execute_workflow_file(&dir.path().join("missing.json"), None)
            .await
            .unwrap_err();
        assert!(matches!(missing, EngineError::Workflow(_)));
    }

    #[tokio::test]
    async fn test_duplicate_step_ids_rejected_before_running() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let spec = WorkflowSpec::new(
            "dup",
            vec![
                echo("a").into(),
                ConcreteStep::new("a", "agent1", "fail").into(),
            ],
        );

        let err = coordinator.execute_workflow(&spec, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Workflow(WorkflowError::DuplicateStepId(ref id)) if id == "a"
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_inside_branch_rejected() {
        let spec = WorkflowSpec::new(
            "nested_dup",
            vec![
                echo("a").into(),
                ConditionalStep::new("cond", "true")
                    .with_else(vec![echo("a").into()])
                    .into(),
            ],
        );
        let err = coordinator().execute_workflow(&spec, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Workflow(WorkflowError::DuplicateStepId(_))));
    }

    #[tokio::test]
    async fn test_rerun_yields_identical_results() {
        let spec = WorkflowSpec::new(
            "repeatable",
            vec![
                echo("gather").with_input("topic", json!("q3")).into(),
                ConditionalStep::new("cond", "gather.topic == 'q3'")
                    .with_depends_on(["gather"])
                    .with_then(vec![
                        echo("summary")
                            .with_input("source", json!("{{gather}}"))
                            .into(),
                    ])
                    .with_else(vec![echo("fallback").into()])
                    .into(),
                echo("report")
                    .with_input("summary", json!("{{ summary }}"))
                    .with_depends_on(["summary"])
                    .into(),
            ],
        );
        let coordinator = coordinator();

        let first = coordinator.execute_workflow(&spec, None).await.unwrap();
        let second = coordinator.execute_workflow(&spec, None).await.unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.status, WorkflowStatus::Completed);
        assert_eq!(first.results(), second.results());
        let ids: Vec<&str> = first.results().into_keys().collect();
        assert_eq!(ids, vec!["gather", "report", "summary"]);
        assert_eq!(
            first.completed["report"].result["summary"]["source"],
            json!({"step": "gather", "topic": "q3"})
        );
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Deadlock {
            pending: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "workflow deadlock: no runnable steps among pending [a, b]"
        );
    }
}
