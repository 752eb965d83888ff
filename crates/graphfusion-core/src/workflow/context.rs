//! Execution context: the results of completed steps, keyed by step id.
//!
//! The context is append-only for the lifetime of a run. It feeds template
//! resolution for step inputs and identifier lookup for branch conditions.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Serialized size above which a stored result is logged as oversized.
pub const LARGE_RESULT_WARN_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Results of the steps completed so far in one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    results: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of a completed step.
    ///
    /// Returns `false` and leaves the existing value untouched if `step_id`
    /// already has a result.
    pub fn insert(&mut self, step_id: &str, result: Value) -> bool {
        if self.results.contains_key(step_id) {
            tracing::warn!(step_id, "ignoring second result for step already in context");
            return false;
        }

        let size = serde_json::to_string(&result).map(|s| s.len()).unwrap_or(0);
        if size > LARGE_RESULT_WARN_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = LARGE_RESULT_WARN_SIZE,
                "step result is unusually large"
            );
        }

        self.results.insert(step_id.to_string(), result);
        true
    }

    pub fn get(&self, step_id: &str) -> Option<&Value> {
        self.results.get(step_id)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.results.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.results.iter().map(|(id, value)| (id.as_str(), value))
    }

    /// The whole context as a JSON object, as seen by `context[...]` in
    /// condition expressions.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .results
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
