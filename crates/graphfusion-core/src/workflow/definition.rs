//! Workflow definition parsing, validation, and filesystem loading.
//!
//! Turns JSON or YAML documents into a validated `WorkflowSpec` and checks
//! the structural constraints the engine relies on (unique ids across the
//! whole step tree, known dependencies, sane timeouts, acyclic graph).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use graphfusion_types::workflow::{StepSpec, WorkflowSpec};
use thiserror::Error;

use super::dag::{flatten_steps, validate_dag};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// JSON/YAML parse failure, including malformed step records.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Two steps anywhere in the tree share an id.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// A step references an id that is declared nowhere in the workflow.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a JSON string into a validated `WorkflowSpec`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowSpec, WorkflowError> {
    let spec: WorkflowSpec =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&spec)?;
    Ok(spec)
}

/// Parse a YAML string into a validated `WorkflowSpec`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowSpec, WorkflowError> {
    let spec: WorkflowSpec =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&spec)?;
    Ok(spec)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowSpec`.
///
/// Checks:
/// - At least one step exists
/// - Step ids are non-empty and unique across the whole tree
/// - No step depends on itself or on a conditional step
/// - All `depends_on` references point to ids declared somewhere in the tree
/// - Timeouts are positive and finite
/// - The dependency graph is acyclic
pub fn validate_definition(spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    if spec.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    if let Some(t) = spec.timeout {
        check_timeout(t, "workflow timeout")?;
    }

    let seen_ids = check_step_ids(spec)?;
    let conditional_ids: HashSet<&str> = flatten_steps(spec)
        .into_iter()
        .filter(|(step, _)| step.is_conditional())
        .map(|(step, _)| step.id())
        .collect();

    let mut stack: Vec<&StepSpec> = spec.steps.iter().collect();
    while let Some(step) = stack.pop() {
        for dep in step.depends_on() {
            if dep == step.id() {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' depends on itself",
                    step.id()
                )));
            }
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id(),
                    dep
                )));
            }
            if conditional_ids.contains(dep.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' depends on conditional step '{}', which never produces a result; \
                     depend on a step inside its branches instead",
                    step.id(),
                    dep
                )));
            }
        }
        match step {
            StepSpec::Concrete(concrete) => {
                if let Some(t) = concrete.timeout_secs {
                    check_timeout(t, &format!("timeout of step '{}'", concrete.id))?;
                }
            }
            StepSpec::Conditional(cond) => {
                if cond.when.trim().is_empty() {
                    return Err(WorkflowError::ValidationError(format!(
                        "conditional step '{}' has an empty condition",
                        cond.id
                    )));
                }
                stack.extend(cond.then_steps.iter().chain(cond.else_steps.iter()));
            }
        }
    }

    validate_dag(spec)
}

/// Check that every declared id, nested branches included, is non-empty and
/// unique. Returns the set of declared ids.
pub fn check_step_ids(spec: &WorkflowSpec) -> Result<HashSet<&str>, WorkflowError> {
    let mut seen_ids = HashSet::new();
    for id in spec.declared_ids() {
        if id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(id) {
            return Err(WorkflowError::DuplicateStepId(id.to_string()));
        }
    }
    Ok(seen_ids)
}

fn check_timeout(secs: f64, what: &str) -> Result<(), WorkflowError> {
    if secs.is_finite() && secs > 0.0 {
        Ok(())
    } else {
        Err(WorkflowError::ValidationError(format!(
            "{what} must be a positive number of seconds, got {secs}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowSpec, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_workflow_json(&content),
        Some("yaml") | Some("yml") => parse_workflow_yaml(&content),
        other => Err(WorkflowError::ParseError(format!(
            "unsupported workflow file extension {:?} for {}",
            other.unwrap_or(""),
            path.display()
        ))),
    }
}

/// Discover all workflow files under `base_dir`.
///
/// Scans recursively for `.json`, `.yaml` and `.yml` files. Files that fail
/// to load are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowSpec)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowSpec)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("json") | Some("yaml") | Some("yml")
        );
        if !is_workflow {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(spec) => results.push((path, spec)),
            Err(err) => {
                tracing::warn!(?path, error = %err, "skipping unloadable workflow file");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
