//! Agent directory for dispatch-time lookup.
//!
//! A simple id-indexed registry of boxed agents. Existence of a step's agent
//! is only checked here, when the step is dispatched.

use std::collections::HashMap;

use super::box_agent::BoxAgent;
use super::provider::Agent;

/// Registry of available agents, indexed by agent id.
///
/// Mutated only while the workflow is being set up; the coordinator shares it
/// read-only behind an `Arc`.
pub struct AgentDirectory {
    agents: HashMap<String, BoxAgent>,
}

impl AgentDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent under its own id.
    ///
    /// If an agent with this id already exists, it is replaced.
    pub fn register<A: Agent + 'static>(&mut self, agent: A) {
        self.register_boxed(BoxAgent::new(agent));
    }

    pub fn register_boxed(&mut self, agent: BoxAgent) {
        let id = agent.id().to_string();
        if self.agents.insert(id.clone(), agent).is_some() {
            tracing::debug!(agent_id = %id, "replaced existing agent");
        }
    }

    /// Remove an agent, returning it if it was registered.
    pub fn remove(&mut self, agent_id: &str) -> Option<BoxAgent> {
        self.agents.remove(agent_id)
    }

    /// Look up an agent by id.
    pub fn get(&self, agent_id: &str) -> Option<&BoxAgent> {
        self.agents.get(agent_id)
    }

    /// First registered agent with the given role, if any.
    pub fn find_by_role(&self, role: &str) -> Option<&BoxAgent> {
        let mut ids: Vec<&String> = self.agents.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.agents.get(id))
            .find(|agent| agent.role() == role)
    }

    /// All registered agent ids, sorted.
    pub fn list_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDirectory")
            .field("agents", &self.list_ids())
            .finish()
    }
}
