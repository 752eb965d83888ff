//! Workflow execution engine for GraphFusion.
//!
//! Coordinates agents executing an interdependent set of steps. Depends only
//! on `graphfusion-types`; agents and the knowledge store are reached through
//! the traits in `agent` and `knowledge`.

pub mod agent;
pub mod config;
pub mod event;
pub mod knowledge;
pub mod workflow;

pub use workflow::{EngineError, WorkflowCoordinator};
