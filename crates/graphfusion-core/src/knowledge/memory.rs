//! In-process knowledge sink that keeps every record in a list.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sink::{KnowledgeError, KnowledgeSink};

/// One fact offered by a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub agent_id: String,
    pub capability: String,
    pub result: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Cloneable handle to a shared in-memory record list.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKnowledgeSink {
    records: Arc<Mutex<Vec<KnowledgeRecord>>>,
}

impl InMemoryKnowledgeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<KnowledgeRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records offered by one agent.
    pub fn records_for(&self, agent_id: &str) -> Vec<KnowledgeRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.agent_id == agent_id)
            .collect()
    }
}

impl KnowledgeSink for InMemoryKnowledgeSink {
    async fn record(
        &self,
        agent_id: &str,
        capability: &str,
        result: &Value,
    ) -> Result<(), KnowledgeError> {
        let record = KnowledgeRecord {
            agent_id: agent_id.to_string(),
            capability: capability.to_string(),
            result: result.clone(),
            recorded_at: Utc::now(),
        };
        self.records
            .lock()
            .map_err(|_| KnowledgeError::Unavailable("record list poisoned".to_string()))?
            .push(record);
        Ok(())
    }
}
