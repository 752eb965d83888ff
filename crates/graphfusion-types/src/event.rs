//! Events published while a workflow runs.
//!
//! Subscribers receive them over the engine's broadcast bus. Publishing never
//! blocks the engine; a lagging subscriber loses events rather than slowing
//! the run down.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        step_count: usize,
    },
    /// A conditional step was expanded into one of its branches.
    BranchSelected {
        run_id: Uuid,
        step_id: String,
        taken: bool,
        /// Ids of the steps spliced into the pending set.
        steps: Vec<String>,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        agent_id: String,
        parallel: bool,
    },
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        error: String,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        attempts: u32,
        error: String,
    },
    /// A pending step can never run because a dependency failed or was skipped.
    StepDropped {
        run_id: Uuid,
        step_id: String,
        blocked_by: String,
    },
    RunFinished {
        run_id: Uuid,
        status: WorkflowStatus,
        completed: usize,
        failed: usize,
        duration_ms: u64,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::BranchSelected { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepRetrying { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepDropped { run_id, .. }
            | WorkflowEvent::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// The step the event is about, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::BranchSelected { step_id, .. }
            | WorkflowEvent::StepStarted { step_id, .. }
            | WorkflowEvent::StepRetrying { step_id, .. }
            | WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::StepDropped { step_id, .. } => Some(step_id),
            WorkflowEvent::RunStarted { .. } | WorkflowEvent::RunFinished { .. } => None,
        }
    }
}
