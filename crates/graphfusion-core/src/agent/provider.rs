//! Agent trait definition.
//!
//! The engine never performs a step's work itself; it hands the resolved
//! input to the agent named by the step and records whatever comes back.

use serde_json::Value;

use graphfusion_types::workflow::StepInput;

/// Errors raised by an agent while running one of its capabilities.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("agent '{agent_id}' has no capability '{capability}'")]
    UnknownCapability { agent_id: String, capability: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

/// A worker unit that exposes named capabilities.
///
/// Uses native async fn in traits (RPITIT). For storage in the
/// `AgentDirectory` agents are wrapped in `BoxAgent`.
pub trait Agent: Send + Sync {
    /// Unique id referenced by steps' `agent_id`.
    fn id(&self) -> &str;

    /// Free-form role description (e.g. "Data Analyst").
    fn role(&self) -> &str;

    /// Names of the capabilities this agent can run.
    fn capabilities(&self) -> Vec<&str>;

    /// Run `capability` with the resolved step input.
    fn invoke(
        &self,
        capability: &str,
        params: &StepInput,
    ) -> impl std::future::Future<Output = Result<Value, CapabilityError>> + Send;
}
