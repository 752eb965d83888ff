//! Agent abstractions for the workflow engine.
//!
//! - `Agent`: RPITIT trait implemented by anything that can run a capability
//! - `BoxAgent`: object-safe wrapper for dynamic dispatch
//! - `CapabilityAgent`: agent assembled from named async closures
//! - `AgentDirectory`: id-indexed lookup used at step dispatch

pub mod box_agent;
pub mod capability;
pub mod directory;
pub mod provider;

pub use box_agent::BoxAgent;
pub use capability::CapabilityAgent;
pub use directory::AgentDirectory;
pub use provider::{Agent, CapabilityError};
