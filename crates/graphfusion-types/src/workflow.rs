//! Workflow domain types.
//!
//! Defines the authored shape of a workflow (`WorkflowSpec` made of
//! `StepSpec`s) and the shape of a finished run (`WorkflowResult`). Step
//! records on the wire are flat key/value documents; they are converted into
//! the tagged `StepSpec` variant through `StepRecord` so that malformed
//! records are rejected with a message naming the offending step.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Ordered mapping of parameter name to literal value or template reference.
pub type StepInput = Map<String, Value>;

// ---------------------------------------------------------------------------
// Step specification
// ---------------------------------------------------------------------------

/// A single authored step: either a concrete unit of work bound to an agent
/// capability, or a conditional that is expanded into one of two branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepRecord", into = "StepRecord")]
pub enum StepSpec {
    Concrete(ConcreteStep),
    Conditional(ConditionalStep),
}

impl StepSpec {
    /// The step's id, unique within a workflow.
    pub fn id(&self) -> &str {
        match self {
            StepSpec::Concrete(step) => &step.id,
            StepSpec::Conditional(step) => &step.id,
        }
    }

    /// Step ids that must complete before this step becomes eligible.
    pub fn depends_on(&self) -> &[String] {
        match self {
            StepSpec::Concrete(step) => &step.depends_on,
            StepSpec::Conditional(step) => &step.depends_on,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, StepSpec::Conditional(_))
    }

    /// Append this step's id and every id declared in its nested branches.
    pub fn collect_ids<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.push(self.id());
        if let StepSpec::Conditional(step) = self {
            for nested in step.then_steps.iter().chain(step.else_steps.iter()) {
                nested.collect_ids(out);
            }
        }
    }
}

impl From<ConcreteStep> for StepSpec {
    fn from(step: ConcreteStep) -> Self {
        StepSpec::Concrete(step)
    }
}

impl From<ConditionalStep> for StepSpec {
    fn from(step: ConditionalStep) -> Self {
        StepSpec::Conditional(step)
    }
}

/// A step executed by invoking `capability` on the agent `agent_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteStep {
    pub id: String,
    pub agent_id: String,
    pub capability: String,
    pub input: StepInput,
    pub depends_on: Vec<String>,
    /// Run concurrently with other parallel steps of the same round.
    pub parallel: bool,
    /// Per-attempt timeout in seconds; the engine default applies when unset.
    pub timeout_secs: Option<f64>,
    /// Remaining retries; the engine default applies when unset.
    pub retries: Option<u32>,
}

impl ConcreteStep {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            capability: capability.into(),
            input: StepInput::new(),
            depends_on: Vec::new(),
            parallel: false,
            timeout_secs: None,
            retries: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.input.insert(name.into(), value);
        self
    }

    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set the remaining-retry counter. Also used to derive the step of a
    /// re-attempt (`retries - 1`) without touching the original.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// The per-attempt timeout, if one was authored and is representable.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// A step replaced at runtime by `then_steps` or `else_steps` depending on
/// the value of `when`. Never executed itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalStep {
    pub id: String,
    pub depends_on: Vec<String>,
    pub when: String,
    pub then_steps: Vec<StepSpec>,
    pub else_steps: Vec<StepSpec>,
}

impl ConditionalStep {
    pub fn new(id: impl Into<String>, when: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            when: when.into(),
            then_steps: Vec::new(),
            else_steps: Vec::new(),
        }
    }

    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_then(mut self, steps: Vec<StepSpec>) -> Self {
        self.then_steps = steps;
        self
    }

    pub fn with_else(mut self, steps: Vec<StepSpec>) -> Self {
        self.else_steps = steps;
        self
    }
}

// ---------------------------------------------------------------------------
// Wire record
// ---------------------------------------------------------------------------

/// Flat key/value form of a step as it appears in JSON or YAML documents.
///
/// ```yaml
/// - id: market_research
///   agent_id: researcher1
///   capability: find_references
///   input: { topic: market_trends }
///   depends_on: [sales_analysis]
///   retries: 2
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    #[serde(default, alias = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, alias = "task", skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: StepInput,
    #[serde(default, alias = "dependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
    #[serde(default, alias = "timeout_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, rename = "then", skip_serializing_if = "Option::is_none")]
    pub then_steps: Option<Vec<StepSpec>>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_steps: Option<Vec<StepSpec>>,
}

/// Why a `StepRecord` could not be turned into a `StepSpec`.
#[derive(Debug, thiserror::Error)]
pub enum StepRecordError {
    #[error("step '{id}' is missing required field '{field}'")]
    MissingField { id: String, field: &'static str },

    #[error("conditional step '{id}' cannot set '{field}'")]
    ConditionalField { id: String, field: &'static str },
}

impl TryFrom<StepRecord> for StepSpec {
    type Error = StepRecordError;

    fn try_from(record: StepRecord) -> Result<Self, Self::Error> {
        let StepRecord {
            id,
            agent_id,
            capability,
            input,
            depends_on,
            parallel,
            timeout,
            retries,
            when,
            then_steps,
            else_steps,
        } = record;

        if let Some(when) = when {
            let forbidden = [
                ("agent_id", agent_id.is_some()),
                ("capability", capability.is_some()),
                ("input", !input.is_empty()),
                ("parallel", parallel),
                ("timeout", timeout.is_some()),
                ("retries", retries.is_some()),
            ];
            if let Some((field, _)) = forbidden.into_iter().find(|(_, set)| *set) {
                return Err(StepRecordError::ConditionalField { id, field });
            }
            return Ok(StepSpec::Conditional(ConditionalStep {
                id,
                depends_on,
                when,
                then_steps: then_steps.unwrap_or_default(),
                else_steps: else_steps.unwrap_or_default(),
            }));
        }

        if then_steps.is_some() || else_steps.is_some() {
            return Err(StepRecordError::MissingField { id, field: "when" });
        }
        let Some(agent_id) = agent_id else {
            return Err(StepRecordError::MissingField { id, field: "agent_id" });
        };
        let Some(capability) = capability else {
            return Err(StepRecordError::MissingField { id, field: "capability" });
        };

        Ok(StepSpec::Concrete(ConcreteStep {
            id,
            agent_id,
            capability,
            input,
            depends_on,
            parallel,
            timeout_secs: timeout,
            retries,
        }))
    }
}

impl From<StepSpec> for StepRecord {
    fn from(spec: StepSpec) -> Self {
        match spec {
            StepSpec::Concrete(step) => StepRecord {
                id: step.id,
                agent_id: Some(step.agent_id),
                capability: Some(step.capability),
                input: step.input,
                depends_on: step.depends_on,
                parallel: step.parallel,
                timeout: step.timeout_secs,
                retries: step.retries,
                ..StepRecord::default()
            },
            StepSpec::Conditional(step) => StepRecord {
                id: step.id,
                depends_on: step.depends_on,
                when: Some(step.when),
                then_steps: Some(step.then_steps),
                else_steps: Some(step.else_steps),
                ..StepRecord::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow specification
// ---------------------------------------------------------------------------

/// An authored workflow: a named list of top-level steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default = "default_workflow_name")]
    pub name: String,
    /// Whole-run timeout in seconds (overrides the engine default).
    #[serde(default, alias = "timeout_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    pub steps: Vec<StepSpec>,
}

fn default_workflow_name() -> String {
    "workflow".to_string()
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            steps,
        }
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Every step id declared anywhere in the workflow, nested branches included.
    pub fn declared_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for step in &self.steps {
            step.collect_ids(&mut ids);
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Run status and result
// ---------------------------------------------------------------------------

/// Final status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Partial,
    Failed,
    Timeout,
}

impl WorkflowStatus {
    /// Derive the status of a run that finished before its deadline.
    ///
    /// `completed` iff nothing failed, `partial` iff both sides are non-empty,
    /// `failed` iff only failures were recorded.
    pub fn from_outcomes(any_completed: bool, any_failed: bool) -> Self {
        match (any_completed, any_failed) {
            (_, false) => WorkflowStatus::Completed,
            (true, true) => WorkflowStatus::Partial,
            (false, true) => WorkflowStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Partial => "partial",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single run. The last four phases are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Building,
    Running,
    Completed,
    Partial,
    Failed,
    TimedOut,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunPhase::Building | RunPhase::Running)
    }
}

impl From<WorkflowStatus> for RunPhase {
    fn from(status: WorkflowStatus) -> Self {
        match status {
            WorkflowStatus::Completed => RunPhase::Completed,
            WorkflowStatus::Partial => RunPhase::Partial,
            WorkflowStatus::Failed => RunPhase::Failed,
            WorkflowStatus::Timeout => RunPhase::TimedOut,
        }
    }
}

/// A successfully completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub result: Value,
    pub completed_at: DateTime<Utc>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Outcome of `execute_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub status: WorkflowStatus,
    pub completed: BTreeMap<String, StepCompletion>,
    /// Step id to error description.
    pub failed: BTreeMap<String, String>,
}

impl WorkflowResult {
    /// Build a result for a run that finished before its deadline; the
    /// status is derived from the two maps.
    pub fn finished(
        run_id: Uuid,
        completed: BTreeMap<String, StepCompletion>,
        failed: BTreeMap<String, String>,
    ) -> Self {
        let status = WorkflowStatus::from_outcomes(!completed.is_empty(), !failed.is_empty());
        Self {
            run_id,
            status,
            completed,
            failed,
        }
    }

    /// Build a result for a run whose deadline elapsed.
    pub fn timed_out(
        run_id: Uuid,
        completed: BTreeMap<String, StepCompletion>,
        failed: BTreeMap<String, String>,
    ) -> Self {
        Self {
            run_id,
            status: WorkflowStatus::Timeout,
            completed,
            failed,
        }
    }

    /// Result values keyed by step id, without timestamps.
    pub fn results(&self) -> BTreeMap<&str, &Value> {
        self.completed
            .iter()
            .map(|(id, completion)| (id.as_str(), &completion.result))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
