//! Shared domain types for the GraphFusion workflow engine.
//!
//! This crate contains the data model consumed and produced by the engine:
//! step and workflow specifications, run results, lifecycle events, and the
//! engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod event;
pub mod workflow;
