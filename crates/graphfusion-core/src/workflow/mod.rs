//! Workflow engine core: definition loading, scheduling, and execution.
//!
//! - `definition` -- JSON/YAML parsing, validation, filesystem load
//! - `dag` -- dependency graph construction and cycle detection
//! - `context` -- append-only results of completed steps
//! - `template` -- `{{step_id}}` input substitution
//! - `expression` -- condition language for conditional steps
//! - `scheduler` -- per-round ready set, branch expansion, pruning
//! - `retry` -- bounded retry policy
//! - `step_runner` -- runs one step against its agent
//! - `executor` -- round-based coordinator with workflow deadline

pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod retry;
pub mod scheduler;
pub mod step_runner;
pub mod template;

pub use executor::{EngineError, WorkflowCoordinator};
