//! Dependency graph validation.
//!
//! Uses `petgraph` to model step dependencies over every id declared in the
//! workflow, nested branches included. A branch step is also placed after
//! its conditional, because it cannot exist before that conditional is
//! expanded. Topological sort then rejects cyclic definitions. Dependencies
//! on a conditional's own id are rejected earlier, in `validate_definition`.

use std::collections::HashMap;

use graphfusion_types::workflow::{StepSpec, WorkflowSpec};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::WorkflowError;

/// Every step of the tree paired with the conditional that contains it.
pub fn flatten_steps(spec: &WorkflowSpec) -> Vec<(&StepSpec, Option<&str>)> {
    let mut out = Vec::new();
    for step in &spec.steps {
        flatten_into(step, None, &mut out);
    }
    out
}

fn flatten_into<'a>(
    step: &'a StepSpec,
    parent: Option<&'a str>,
    out: &mut Vec<(&'a StepSpec, Option<&'a str>)>,
) {
    out.push((step, parent));
    if let StepSpec::Conditional(cond) = step {
        for nested in cond.then_steps.iter().chain(cond.else_steps.iter()) {
            flatten_into(nested, Some(&cond.id), out);
        }
    }
}

/// Validate that the workflow's steps form a DAG.
///
/// Edges run dependency -> dependent and conditional -> branch step.
/// Ids must already be unique; duplicate ids collapse onto one node.
pub fn validate_dag(spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    let steps = flatten_steps(spec);

    let mut graph = DiGraph::<&str, ()>::new();
    let mut id_to_node: HashMap<&str, NodeIndex> = HashMap::new();
    for (step, _) in &steps {
        id_to_node
            .entry(step.id())
            .or_insert_with(|| graph.add_node(step.id()));
    }

    for (step, parent) in &steps {
        let to = id_to_node[step.id()];
        for dep in step.depends_on() {
            let from = id_to_node.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id(),
                    dep
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
        if let Some(parent) = parent {
            graph.add_edge(id_to_node[parent], to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{}'", node_id))
    })?;

    Ok(())
}
