//! BoxAgent -- object-safe dynamic dispatch wrapper for Agent.
//!
//! 1. `AgentDyn` is an object-safe mirror of `Agent` with boxed futures
//! 2. Every `T: Agent` gets `AgentDyn` through a blanket impl
//! 3. `BoxAgent` wraps `Box<dyn AgentDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use graphfusion_types::workflow::StepInput;

use super::provider::{Agent, CapabilityError};

/// Object-safe version of [`Agent`] with boxed futures.
pub trait AgentDyn: Send + Sync {
    fn id(&self) -> &str;

    fn role(&self) -> &str;

    fn capabilities(&self) -> Vec<&str>;

    fn invoke_boxed<'a>(
        &'a self,
        capability: &'a str,
        params: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>>;
}

impl<T: Agent> AgentDyn for T {
    fn id(&self) -> &str {
        Agent::id(self)
    }

    fn role(&self) -> &str {
        Agent::role(self)
    }

    fn capabilities(&self) -> Vec<&str> {
        Agent::capabilities(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        capability: &'a str,
        params: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>> {
        Box::pin(self.invoke(capability, params))
    }
}

/// Type-erased agent, so agents of different concrete types can share one
/// directory.
pub struct BoxAgent {
    inner: Box<dyn AgentDyn + Send + Sync>,
}

impl BoxAgent {
    pub fn new<T: Agent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn role(&self) -> &str {
        self.inner.role()
    }

    pub fn capabilities(&self) -> Vec<&str> {
        self.inner.capabilities()
    }

    pub async fn invoke(
        &self,
        capability: &str,
        params: &StepInput,
    ) -> Result<Value, CapabilityError> {
        self.inner.invoke_boxed(capability, params).await
    }
}

impl std::fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgent")
            .field("id", &self.id())
            .field("role", &self.role())
            .finish()
    }
}
