//! `KnowledgeSink` trait and its object-safe wrapper.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("knowledge store unavailable: {0}")]
    Unavailable(String),

    #[error("knowledge record rejected: {0}")]
    Rejected(String),
}

/// Receives the result of every successful step.
pub trait KnowledgeSink: Send + Sync {
    fn record(
        &self,
        agent_id: &str,
        capability: &str,
        result: &Value,
    ) -> impl Future<Output = Result<(), KnowledgeError>> + Send;
}

/// Object-safe version of [`KnowledgeSink`] with boxed futures.
pub trait KnowledgeSinkDyn: Send + Sync {
    fn record_boxed<'a>(
        &'a self,
        agent_id: &'a str,
        capability: &'a str,
        result: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), KnowledgeError>> + Send + 'a>>;
}

impl<T: KnowledgeSink> KnowledgeSinkDyn for T {
    fn record_boxed<'a>(
        &'a self,
        agent_id: &'a str,
        capability: &'a str,
        result: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), KnowledgeError>> + Send + 'a>> {
        Box::pin(self.record(agent_id, capability, result))
    }
}

/// Type-erased knowledge sink held by the coordinator.
pub struct BoxKnowledgeSink {
    inner: Box<dyn KnowledgeSinkDyn + Send + Sync>,
}

impl BoxKnowledgeSink {
    pub fn new<T: KnowledgeSink + 'static>(sink: T) -> Self {
        Self {
            inner: Box::new(sink),
        }
    }

    pub async fn record(
        &self,
        agent_id: &str,
        capability: &str,
        result: &Value,
    ) -> Result<(), KnowledgeError> {
        self.inner.record_boxed(agent_id, capability, result).await
    }
}

impl std::fmt::Debug for BoxKnowledgeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxKnowledgeSink").finish_non_exhaustive()
    }
}
