//! Step execution: condition gates, `forEach` fan-out, the six engine-native
//! tools, and delegation to the injected tool backend.
//!
//! `StepExecutor` resolves a step's inputs against the execution context and
//! dispatches on the tool kind. Control-flow tools run inside the engine
//! because their semantics are part of the scheduling contract:
//! - `conditional`: evaluates a condition and enables one branch's steps
//! - `loop`: runs an inline step per item, sequentially, under a hard
//!   iteration cap
//! - `merge`: combines source arrays (`concat`, `interleave`, `unique`)
//! - `filter` / `transform`: per-item expression evaluation with `item` bound
//! - `template`: text composition over the full context
//!
//! Everything else is delegated to a [`ToolInvoker`]. The engine supplies
//! resolved inputs and run metadata; it knows nothing about transport.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ragloom_types::workflow::{MergeStrategy, Step, ToolKind};

use super::context::{INPUTS_KEY, ScopedBinding};
use super::expr::{self, Scope};
use super::template;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Hard iteration cap for `loop` steps and implicit `forEach` loops when the
/// author does not set `maxIterations`.
pub const DEFAULT_MAX_ITERATIONS: u64 = 100;

/// Binding name for the current element in `forEach`, `filter`, and
/// `transform` expressions, and the default `loop` binding.
pub const ITEM_BINDING: &str = "item";

// ---------------------------------------------------------------------------
// ToolInvoker
// ---------------------------------------------------------------------------

/// One delegated tool invocation: resolved inputs plus run metadata.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub run_id: Uuid,
    pub workflow: String,
    pub step_id: String,
    pub tool: ToolKind,
    /// Fully resolved step inputs (no markers remain).
    pub inputs: Value,
}

/// Backend for tools that reach external services (retrieval, embedding,
/// generation, HTTP, and the rest of the non-native kinds).
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait ToolInvoker: Send + Sync {
    /// Run one tool call and return its output value.
    ///
    /// Timeouts and retries are this collaborator's responsibility; the
    /// engine treats any error as the step failing.
    fn invoke(&self, call: ToolCall) -> impl Future<Output = anyhow::Result<Value>> + Send;
}

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// Output from a step execution.
#[derive(Debug, Clone)]
pub enum StepOutput {
    /// Condition was falsy; nothing executed.
    Skipped { reason: String },
    /// Generic JSON output.
    Value(Value),
    /// Conditional branch selection.
    Branch {
        /// Whether the condition was true.
        condition_met: bool,
        /// Step IDs the selected branch enables.
        enabled: Vec<String>,
    },
}

impl StepOutput {
    /// Convert to a JSON value for context storage.
    pub fn to_value(&self) -> Value {
        match self {
            StepOutput::Skipped { reason } => json!({ "skipped": true, "reason": reason }),
            StepOutput::Value(v) => v.clone(),
            StepOutput::Branch {
                condition_met,
                enabled,
            } => json!({ "conditionMet": condition_met, "enabled": enabled }),
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors from executing a single step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// A tool input was missing or had the wrong shape.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A condition, `forEach`, or tool expression did not parse.
    #[error("expression error: {0}")]
    Expression(String),

    /// The delegated tool collaborator failed.
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: ToolKind, message: String },

    /// Planned iterations exceed the cap. Raised before the first
    /// iteration, never as silent truncation.
    #[error("loop of {planned} items exceeds the {max} iteration cap")]
    LoopBound { planned: usize, max: u64 },

    /// The run's cancellation token fired at an iteration boundary.
    #[error("run cancelled")]
    Cancelled,
}

impl StepError {
    /// Fatal errors abort the run even under `continueOnError`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::LoopBound { .. } | StepError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual steps against a scope, dispatching native tools
/// in-engine and everything else to the injected backend.
pub struct StepExecutor<T: ToolInvoker> {
    invoker: Arc<T>,
    run_id: Uuid,
    workflow: String,
    /// Checked between loop iterations; a long fan-out should not outlive
    /// its cancelled run.
    cancel: CancellationToken,
}

impl<T: ToolInvoker> StepExecutor<T> {
    pub fn new(
        invoker: Arc<T>,
        run_id: Uuid,
        workflow: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            invoker,
            run_id,
            workflow: workflow.into(),
            cancel,
        }
    }

    /// Run one step: condition gate, then `forEach` fan-out, then dispatch.
    pub async fn execute(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        if let Some(condition) = &step.condition {
            let met = evaluate_condition(condition, scope)?;
            if !met {
                tracing::debug!(step = %step.id, condition, "condition false, skipping step");
                return Ok(StepOutput::Skipped {
                    reason: format!("condition '{condition}' evaluated false"),
                });
            }
        }

        // A forEach step is a loop in disguise unless the tool is natively
        // `loop`, which carries its own iteration config.
        if step.tool != ToolKind::Loop {
            if let Some(for_each) = &step.for_each {
                return self.run_for_each(step, for_each, scope).await;
            }
        }

        self.dispatch(step, scope).await
    }

    /// Indirection so `loop` can re-enter `execute` for its inline step
    /// without an infinitely sized future.
    fn execute_boxed<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a dyn Scope,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send + 'a>> {
        Box::pin(self.execute(step, scope))
    }

    async fn dispatch(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        match step.tool {
            ToolKind::Conditional => self.run_conditional(step, scope),
            ToolKind::Loop => self.run_loop(step, scope).await,
            ToolKind::Merge => self.run_merge(step, scope),
            ToolKind::Filter => self.run_filter(step, scope),
            ToolKind::Transform => self.run_transform(step, scope),
            ToolKind::Template => self.run_template(step, scope),
            _ => self.run_delegated(step, scope).await,
        }
    }

    // -- Implicit loop: one dispatch per item with `item` bound --

    async fn run_for_each(
        &self,
        step: &Step,
        source: &str,
        scope: &dyn Scope,
    ) -> Result<StepOutput, StepError> {
        let parsed = expr::parse_expression(source)
            .map_err(|err| StepError::Expression(format!("forEach '{source}': {err}")))?;
        let items = match parsed.eval(scope) {
            Value::Array(items) => items,
            other => {
                return Err(StepError::InvalidInput(format!(
                    "forEach '{source}' resolved to {}, expected an array",
                    kind_of(&other)
                )));
            }
        };
        if items.len() as u64 > DEFAULT_MAX_ITERATIONS {
            return Err(StepError::LoopBound {
                planned: items.len(),
                max: DEFAULT_MAX_ITERATIONS,
            });
        }

        let mut outputs = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            let scoped = ScopedBinding::new(scope, ITEM_BINDING, item.clone());
            match self.dispatch(step, &scoped).await {
                Ok(output) => outputs.push(output.to_value()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if step.continue_on_error => {
                    tracing::warn!(step = %step.id, index, error = %err, "forEach iteration failed, continuing");
                    outputs.push(json!({ "error": err.to_string() }));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(StepOutput::Value(Value::Array(outputs)))
    }

    // -- Delegated tools: resolve inputs, hand off, capture output --

    async fn run_delegated(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        let inputs = resolve_inputs(step, scope);
        tracing::debug!(step = %step.id, tool = %step.tool, "invoking delegated tool");
        let call = ToolCall {
            run_id: self.run_id,
            workflow: self.workflow.clone(),
            step_id: step.id.clone(),
            tool: step.tool,
            inputs,
        };
        self.invoker
            .invoke(call)
            .await
            .map(StepOutput::Value)
            .map_err(|err| StepError::ToolFailed {
                tool: step.tool,
                message: err.to_string(),
            })
    }

    // -- Conditional: evaluate, enable one branch's steps --

    fn run_conditional(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        let condition = required_str(step, "condition")?;
        let condition_met = evaluate_condition(condition, scope)?;
        let branch = if condition_met { "then" } else { "else" };
        let enabled: Vec<String> = step
            .inputs
            .get(branch)
            .and_then(Value::as_array)
            .map(|targets| {
                targets
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        tracing::debug!(
            step = %step.id,
            condition,
            result = condition_met,
            enabled = ?enabled,
            "conditional branch selected"
        );
        Ok(StepOutput::Branch {
            condition_met,
            enabled,
        })
    }

    // -- Loop: inline step per item, sequential, hard-capped --

    async fn run_loop(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        let items = self.resolve_loop_items(step, scope)?;
        let max = step
            .inputs
            .get("maxIterations")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        if items.len() as u64 > max {
            return Err(StepError::LoopBound {
                planned: items.len(),
                max,
            });
        }

        let binding = step
            .inputs
            .get("as")
            .and_then(Value::as_str)
            .unwrap_or(ITEM_BINDING);
        let inline: Step = match step.inputs.get("step") {
            Some(inner) => serde_json::from_value(inner.clone()).map_err(|err| {
                StepError::InvalidInput(format!("inline loop step is malformed: {err}"))
            })?,
            None => {
                return Err(StepError::InvalidInput(
                    "loop step requires input 'step'".to_string(),
                ));
            }
        };

        let mut results = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        let mut iterations = 0u64;
        for (index, item) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            let scoped = ScopedBinding::new(scope, binding, item.clone());
            match self.execute_boxed(&inline, &scoped).await {
                Ok(output) => results.push(output.to_value()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if inline.continue_on_error => {
                    tracing::warn!(step = %step.id, index, error = %err, "loop iteration failed, continuing");
                    errors.push(json!({ "index": index, "error": err.to_string() }));
                }
                Err(err) => {
                    tracing::warn!(step = %step.id, index, error = %err, "loop iteration failed, aborting");
                    return Err(err);
                }
            }
            iterations += 1;
        }

        Ok(StepOutput::Value(json!({
            "results": results,
            "errors": errors,
            "iterations": iterations,
        })))
    }

    fn resolve_loop_items(&self, step: &Step, scope: &dyn Scope) -> Result<Vec<Value>, StepError> {
        let source = required(step, "items")?;
        let resolved = match source {
            // A string is an items expression, bare or marker-wrapped.
            Value::String(expression) => expr::parse_expression(expression)
                .map_err(|err| StepError::Expression(format!("items '{expression}': {err}")))?
                .eval(scope),
            // Anything else is a literal, possibly containing markers.
            other => {
                let mut referenced = BTreeSet::new();
                template::resolve_value(other, scope, &mut referenced)
            }
        };
        match resolved {
            Value::Array(items) => Ok(items),
            other => Err(StepError::InvalidInput(format!(
                "loop items resolved to {}, expected an array",
                kind_of(&other)
            ))),
        }
    }

    // -- Merge: combine source arrays --

    fn run_merge(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        let mut referenced = BTreeSet::new();
        let resolved = template::resolve_value(required(step, "sources")?, scope, &mut referenced);
        let sources = match resolved {
            Value::Array(sources) => sources,
            other => {
                return Err(StepError::InvalidInput(format!(
                    "merge sources resolved to {}, expected an array",
                    kind_of(&other)
                )));
            }
        };
        let mut arrays = Vec::with_capacity(sources.len());
        for source in sources {
            match source {
                Value::Array(items) => arrays.push(items),
                // A source that resolved to nothing contributes nothing.
                Value::Null => {}
                scalar => arrays.push(vec![scalar]),
            }
        }

        let strategy = match step.inputs.get("strategy") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                StepError::InvalidInput(format!("unknown merge strategy {value}"))
            })?,
            None => MergeStrategy::default(),
        };

        let merged = match strategy {
            MergeStrategy::Concat => arrays.into_iter().flatten().collect(),
            MergeStrategy::Interleave => interleave(arrays),
            MergeStrategy::Unique => unique(arrays),
        };
        Ok(StepOutput::Value(Value::Array(merged)))
    }

    // -- Filter: keep items whose condition holds --

    fn run_filter(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        let items = resolve_items(step, scope)?;
        let condition = required_str(step, "condition")?;
        let parsed = expr::parse_expression(condition)
            .map_err(|err| StepError::Expression(format!("condition '{condition}': {err}")))?;

        let total = items.len();
        let mut kept = Vec::new();
        for item in items {
            let scoped = ScopedBinding::new(scope, ITEM_BINDING, item.clone());
            if parsed.eval_bool(&scoped) {
                kept.push(item);
            }
        }
        let removed = total - kept.len();
        Ok(StepOutput::Value(json!({
            "items": kept,
            "count": kept.len(),
            "removed": removed,
        })))
    }

    // -- Transform: map items through an expression --

    fn run_transform(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        let items = resolve_items(step, scope)?;
        let expression = required_str(step, "expression")?;
        let parsed = expr::parse_expression(expression)
            .map_err(|err| StepError::Expression(format!("expression '{expression}': {err}")))?;

        let mapped: Vec<Value> = items
            .into_iter()
            .map(|item| {
                let scoped = ScopedBinding::new(scope, ITEM_BINDING, item);
                parsed.eval(&scoped)
            })
            .collect();
        Ok(StepOutput::Value(Value::Array(mapped)))
    }

    // -- Template: pure text composition --

    fn run_template(&self, step: &Step, scope: &dyn Scope) -> Result<StepOutput, StepError> {
        let text = required_str(step, "text")?;
        let mut referenced = BTreeSet::new();
        let resolved = template::resolve_str(text, scope, &mut referenced);
        let text = match resolved {
            Value::String(s) => s,
            other => template::value_to_string(&other),
        };
        let references: Vec<String> = referenced
            .into_iter()
            .filter(|root| root != INPUTS_KEY)
            .collect();
        Ok(StepOutput::Value(json!({
            "text": text,
            "references": references,
        })))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn evaluate_condition(condition: &str, scope: &dyn Scope) -> Result<bool, StepError> {
    let parsed = expr::parse_expression(condition)
        .map_err(|err| StepError::Expression(format!("condition '{condition}': {err}")))?;
    Ok(parsed.eval_bool(scope))
}

fn resolve_inputs(step: &Step, scope: &dyn Scope) -> Value {
    let mut referenced = BTreeSet::new();
    let map: serde_json::Map<String, Value> = step
        .inputs
        .iter()
        .map(|(key, value)| (key.clone(), template::resolve_value(value, scope, &mut referenced)))
        .collect();
    Value::Object(map)
}

/// Resolve the `items` input of `filter`/`transform`: a marker string or a
/// literal array.
fn resolve_items(step: &Step, scope: &dyn Scope) -> Result<Vec<Value>, StepError> {
    let mut referenced = BTreeSet::new();
    match template::resolve_value(required(step, "items")?, scope, &mut referenced) {
        Value::Array(items) => Ok(items),
        other => Err(StepError::InvalidInput(format!(
            "items resolved to {}, expected an array",
            kind_of(&other)
        ))),
    }
}

fn required<'a>(step: &'a Step, key: &str) -> Result<&'a Value, StepError> {
    step.inputs.get(key).ok_or_else(|| {
        StepError::InvalidInput(format!("{} step requires input '{key}'", step.tool))
    })
}

fn required_str<'a>(step: &'a Step, key: &str) -> Result<&'a str, StepError> {
    match required(step, key)? {
        Value::String(s) => Ok(s),
        other => Err(StepError::InvalidInput(format!(
            "'{key}' must be a string, got {}",
            kind_of(other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn interleave(arrays: Vec<Vec<Value>>) -> Vec<Value> {
    let longest = arrays.iter().map(Vec::len).max().unwrap_or(0);
    let mut merged = Vec::new();
    for i in 0..longest {
        for array in &arrays {
            if let Some(item) = array.get(i) {
                merged.push(item.clone());
            }
        }
    }
    merged
}

/// De-duplicate by value across all sources, preserving first-seen order.
fn unique(arrays: Vec<Vec<Value>>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for item in arrays.into_iter().flatten() {
        let key = serde_json::to_string(&item).unwrap_or_default();
        if seen.insert(key) {
            merged.push(item);
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
