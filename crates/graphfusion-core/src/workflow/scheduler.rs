//! Ready-set scheduler.
//!
//! Holds the steps of a run that are not yet terminal and, once per round,
//! hands back those whose dependencies have all completed. Conditional steps
//! are expanded lazily into the branch their condition selects. Steps that
//! can no longer run, because something they depend on failed or was on the
//! branch not taken, are dropped.

use std::collections::{BTreeMap, HashSet};

use graphfusion_types::workflow::{ConcreteStep, ConditionalStep, StepSpec};

use super::context::ExecutionContext;
use super::expression::{ExpressionError, evaluate_condition};

/// A conditional step that was replaced by one of its branches.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchDecision {
    pub step_id: String,
    /// `true` if the `then` branch was taken.
    pub taken: bool,
    /// Ids of the top-level steps of the chosen branch.
    pub spliced: Vec<String>,
    /// Set when the condition could not be evaluated and `else` was taken.
    pub error: Option<ExpressionError>,
}

/// A pending step removed because it can never become eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedStep {
    pub step_id: String,
    /// The failed, skipped or dropped dependency that blocks it.
    pub blocked_by: String,
}

/// What the scheduler decided for one round.
#[derive(Debug, Default)]
pub struct Round {
    /// Concrete steps to execute now, in the order they became ready.
    pub executable: Vec<ConcreteStep>,
    pub branches: Vec<BranchDecision>,
    pub dropped: Vec<DroppedStep>,
}

#[derive(Debug)]
pub struct Scheduler {
    pending: Vec<StepSpec>,
    /// Ids that will never run: declared on untaken branches or dropped.
    unreachable: HashSet<String>,
}

impl Scheduler {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            pending: steps,
            unreachable: HashSet::new(),
        }
    }

    /// True once every step has been handed out, expanded or dropped.
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().map(|s| s.id().to_string()).collect()
    }

    /// Compute the next round against the current outcomes.
    ///
    /// Executable steps are removed from the pending set. An empty
    /// `executable` while [`is_finished`](Self::is_finished) is false means
    /// no pending step can ever run.
    pub fn next_round(
        &mut self,
        context: &ExecutionContext,
        failed: &BTreeMap<String, String>,
    ) -> Round {
        let mut round = Round::default();

        while let Some(index) = self
            .pending
            .iter()
            .position(|step| step.is_conditional() && dependencies_met(step, context))
        {
            let StepSpec::Conditional(cond) = self.pending.remove(index) else {
                continue;
            };
            let decision = self.expand(cond, index, context);
            round.branches.push(decision);
        }

        self.prune(context, failed, &mut round.dropped);

        let mut i = 0;
        while i < self.pending.len() {
            let ready = matches!(&self.pending[i], StepSpec::Concrete(_))
                && dependencies_met(&self.pending[i], context);
            if !ready {
                i += 1;
                continue;
            }
            if let StepSpec::Concrete(step) = self.pending.remove(i) {
                round.executable.push(step);
            }
        }

        round
    }

    /// Splice the chosen branch in place of `cond` and mark every id of the
    /// other branch unreachable.
    fn expand(
        &mut self,
        cond: ConditionalStep,
        index: usize,
        context: &ExecutionContext,
    ) -> BranchDecision {
        let (taken, error) = match evaluate_condition(&cond.when, context) {
            Ok(value) => (value, None),
            Err(err) => {
                tracing::warn!(
                    step_id = %cond.id,
                    condition = %cond.when,
                    error = %err,
                    "condition evaluation failed, taking else branch"
                );
                (false, Some(err))
            }
        };

        let (chosen, skipped) = if taken {
            (cond.then_steps, cond.else_steps)
        } else {
            (cond.else_steps, cond.then_steps)
        };

        let mut skipped_ids = Vec::new();
        for step in &skipped {
            step.collect_ids(&mut skipped_ids);
        }
        self.unreachable
            .extend(skipped_ids.into_iter().map(str::to_string));

        let spliced: Vec<String> = chosen.iter().map(|s| s.id().to_string()).collect();
        tracing::debug!(step_id = %cond.id, taken, steps = ?spliced, "conditional expanded");
        let tail = self.pending.split_off(index);
        self.pending.extend(chosen);
        self.pending.extend(tail);

        BranchDecision {
            step_id: cond.id,
            taken,
            spliced,
            error,
        }
    }

    /// Drop pending steps that depend on a failed or unreachable id, until
    /// nothing more can be dropped.
    fn prune(
        &mut self,
        context: &ExecutionContext,
        failed: &BTreeMap<String, String>,
        dropped: &mut Vec<DroppedStep>,
    ) {
        loop {
            let blocked = self.pending.iter().enumerate().find_map(|(i, step)| {
                step.depends_on()
                    .iter()
                    .find(|dep| {
                        !context.contains(dep)
                            && (failed.contains_key(dep.as_str())
                                || self.unreachable.contains(dep.as_str()))
                    })
                    .map(|dep| (i, dep.clone()))
            });
            let Some((index, blocked_by)) = blocked else {
                return;
            };

            let step = self.pending.remove(index);
            let mut ids = Vec::new();
            step.collect_ids(&mut ids);
            self.unreachable.extend(ids.into_iter().map(str::to_string));

            tracing::debug!(step_id = step.id(), blocked_by = %blocked_by, "dropping unreachable step");
            dropped.push(DroppedStep {
                step_id: step.id().to_string(),
                blocked_by,
            });
        }
    }
}

fn dependencies_met(step: &StepSpec, context: &ExecutionContext) -> bool {
    step.depends_on().iter().all(|dep| context.contains(dep))
}
