//! Agent assembled from named async closures.
//!
//! ```ignore
//! let analyst = CapabilityAgent::new("analyst1", "Data Analyst")
//!     .with_capability("analyze_data", |params| async move {
//!         Ok(json!(format!("Analysis of {}", params["data"])))
//!     });
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;

use graphfusion_types::workflow::StepInput;

use super::provider::{Agent, CapabilityError};

type CapabilityFn =
    Arc<dyn Fn(StepInput) -> BoxFuture<'static, Result<Value, CapabilityError>> + Send + Sync>;

/// An [`Agent`] whose capabilities are closures registered by name.
#[derive(Clone)]
pub struct CapabilityAgent {
    id: String,
    role: String,
    capabilities: BTreeMap<String, CapabilityFn>,
}

impl CapabilityAgent {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: BTreeMap::new(),
        }
    }

    /// Register `handler` under `name`, replacing any previous handler.
    ///
    /// The handler receives its own copy of the resolved step input.
    pub fn with_capability<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
    {
        let handler: CapabilityFn = Arc::new(move |params| handler(params).boxed());
        self.capabilities.insert(name.into(), handler);
        self
    }
}

impl Agent for CapabilityAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn capabilities(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    async fn invoke(&self, capability: &str, params: &StepInput) -> Result<Value, CapabilityError> {
        let Some(handler) = self.capabilities.get(capability) else {
            return Err(CapabilityError::UnknownCapability {
                agent_id: self.id.clone(),
                capability: capability.to_string(),
            });
        };
        tracing::trace!(agent_id = %self.id, capability, "invoking capability");
        handler(params.clone()).await
    }
}

impl std::fmt::Debug for CapabilityAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityAgent")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}
