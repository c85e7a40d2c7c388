//! Workflow execution context: input seeding and write-once step outputs.
//!
//! `ExecutionContext` is the shared state of a run. It holds the merged
//! workflow inputs under the reserved `inputs` root and one entry per
//! completed step under the step's ID, shaped as `{ "output": <value> }`
//! so that paths read `find.output.hits`. Entries are write-once: a second
//! write to the same step ID is an engine bug and fails loudly.
//!
//! Event payloads are summarized before publishing; the context itself
//! always holds full values.

use std::collections::HashMap;

use serde_json::{Value, json};
use uuid::Uuid;

use ragloom_types::workflow::WorkflowDefinition;

use super::expr::Scope;

/// Reserved context root holding the merged workflow inputs.
pub const INPUTS_KEY: &str = "inputs";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while seeding or writing the context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("missing required workflow inputs: {0}")]
    MissingInputs(String),

    #[error("step '{0}' wrote its output twice")]
    DuplicateStepOutput(String),

    #[error("'{0}' is reserved and cannot be used as a step ID")]
    ReservedKey(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Shared state of a single workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Workflow name, carried into tool calls and events.
    pub workflow: String,
    /// Run ID.
    pub run_id: Uuid,
    values: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Seed a context from a workflow definition and caller-supplied inputs.
    ///
    /// Merge order, later wins: workflow `defaults`, per-input declared
    /// defaults, caller inputs. Declared inputs marked `required` must be
    /// present after the merge.
    pub fn new(
        workflow: &WorkflowDefinition,
        run_id: Uuid,
        caller_inputs: HashMap<String, Value>,
    ) -> Result<Self, ContextError> {
        let mut merged = serde_json::Map::new();
        for (name, value) in &workflow.defaults {
            merged.insert(name.clone(), value.clone());
        }
        for (name, spec) in &workflow.inputs {
            if let Some(default) = &spec.default {
                merged.insert(name.clone(), default.clone());
            }
        }
        for (name, value) in caller_inputs {
            merged.insert(name, value);
        }

        let mut missing: Vec<&str> = workflow
            .inputs
            .iter()
            .filter(|(name, spec)| spec.required && !merged.contains_key(*name))
            .map(|(name, _)| name.as_str())
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(ContextError::MissingInputs(missing.join(", ")));
        }

        let mut values = HashMap::new();
        values.insert(INPUTS_KEY.to_string(), Value::Object(merged));
        Ok(Self {
            workflow: workflow.name.clone(),
            run_id,
            values,
        })
    }

    /// Store the output of a completed step under `<step_id>.output`.
    pub fn set_step_output(&mut self, step_id: &str, output: Value) -> Result<(), ContextError> {
        if step_id == INPUTS_KEY {
            return Err(ContextError::ReservedKey(step_id.to_string()));
        }
        if self.values.contains_key(step_id) {
            return Err(ContextError::DuplicateStepOutput(step_id.to_string()));
        }
        self.values
            .insert(step_id.to_string(), json!({ "output": output }));
        Ok(())
    }

    /// The merged workflow inputs.
    pub fn inputs(&self) -> &Value {
        &self.values[INPUTS_KEY]
    }

    /// The recorded output of a completed step, if any.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.values.get(step_id)?.get("output")
    }

    /// Whether a step has recorded an output (or error marker).
    pub fn has_step(&self, step_id: &str) -> bool {
        self.values.contains_key(step_id)
    }
}

impl Scope for ExecutionContext {
    fn root(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

// ---------------------------------------------------------------------------
// ScopedBinding
// ---------------------------------------------------------------------------

/// A scope with one extra named binding layered over a base scope.
///
/// Used for loop-local names (`item`, or a loop's `as` name). Bindings
/// shadow the base; nested loops layer further bindings.
pub struct ScopedBinding<'a> {
    base: &'a dyn Scope,
    name: &'a str,
    value: Value,
}

impl<'a> ScopedBinding<'a> {
    pub fn new(base: &'a dyn Scope, name: &'a str, value: Value) -> Self {
        Self { base, name, value }
    }
}

impl Scope for ScopedBinding<'_> {
    fn root(&self, name: &str) -> Option<&Value> {
        if name == self.name {
            Some(&self.value)
        } else {
            self.base.root(name)
        }
    }
}

// ---------------------------------------------------------------------------
// Event payload summaries
// ---------------------------------------------------------------------------

/// Preview length kept when a payload is summarized.
const SUMMARY_PREVIEW_BYTES: usize = 160;

/// Summarize a value for event publishing.
///
/// Values whose compact JSON fits in `max_bytes` are returned whole;
/// larger ones are replaced by a marker with the original size and a
/// short preview.
pub fn summarize_value(value: &Value, max_bytes: usize) -> Value {
    let serialized = serde_json::to_string(value).unwrap_or_default();
    if serialized.len() <= max_bytes {
        return value.clone();
    }
    let mut end = SUMMARY_PREVIEW_BYTES.min(serialized.len());
    while !serialized.is_char_boundary(end) {
        end -= 1;
    }
    json!({
        "_truncated": true,
        "_original_size": serialized.len(),
        "_preview": &serialized[..end],
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
