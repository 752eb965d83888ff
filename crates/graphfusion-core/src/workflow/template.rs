//! Step input template resolution.
//!
//! An input value that is exactly the string `{{step_id}}` is replaced by
//! that step's result. Whitespace inside the braces is tolerated
//! (`{{ step_id }}`). Anything else, including strings that merely contain a
//! template, passes through unchanged.

use graphfusion_types::workflow::StepInput;
use serde_json::Value;

use super::context::ExecutionContext;

/// Output of [`resolve_input`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    /// Input with every resolvable reference substituted, in authored order.
    pub values: StepInput,
    /// Step ids referenced but absent from the context. Their values are left
    /// as the literal template string.
    pub unresolved: Vec<String>,
}

impl ResolvedInput {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// The step id referenced by `value`, if it is a whole-value template.
pub fn template_reference(value: &Value) -> Option<&str> {
    let s = value.as_str()?;
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    if inner.is_empty() || inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Substitute template references in `input` with results from `context`.
pub fn resolve_input(input: &StepInput, context: &ExecutionContext) -> ResolvedInput {
    let mut unresolved = Vec::new();
    let values = input
        .iter()
        .map(|(name, value)| {
            let resolved = match template_reference(value) {
                Some(step_id) => match context.get(step_id) {
                    Some(result) => result.clone(),
                    None => {
                        unresolved.push(step_id.to_string());
                        value.clone()
                    }
                },
                None => value.clone(),
            };
            (name.clone(), resolved)
        })
        .collect();

    ResolvedInput { values, unresolved }
}
