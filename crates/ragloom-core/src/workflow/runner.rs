//! Workflow orchestrator: validation gate, layer walk, progress events.
//!
//! `WorkflowRunner` is the run-level entry point. Each `execute` call:
//!
//! 1. Strict-validates the definition and refuses to start on any finding.
//! 2. Builds the dependency graph and layered execution plan.
//! 3. Seeds an `ExecutionContext` from defaults, declared inputs, and
//!    caller-supplied inputs.
//! 4. Walks layers in plan order, running each step through `StepExecutor`,
//!    recording outcomes, and handing events to the optional progress sink.
//! 5. Resolves the definition's `output` expression against the final
//!    context (completed runs only).
//!
//! Steps run sequentially in plan order, so the event stream for a given
//! definition and inputs is deterministic. Cancellation is checked between
//! steps and between loop iterations; the optional wall-clock budget is
//! checked between steps. Neither preempts a tool call that is already
//! running.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ragloom_types::event::WorkflowEvent;
use ragloom_types::workflow::{
    ExecutionResult, RunStatus, Step, StepRecord, StepStatus, WorkflowDefinition,
};

use super::context::{ContextError, ExecutionContext, summarize_value};
use super::definition::issues_summary;
use super::graph::{
    ExecutionPlan, GraphError, build_dependency_graph, conditional_gates, plan_from_graph,
};
use super::template;
use super::tools::{StepError, StepExecutor, StepOutput, ToolInvoker};
use super::validate::{ValidationIssue, validate_strict};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Step outputs larger than this (serialized) are truncated in events and
/// run records. The execution context always keeps the full value.
pub const MAX_EVENT_PAYLOAD_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// ProgressSink
// ---------------------------------------------------------------------------

/// Observer for step lifecycle events during a run.
///
/// All methods default to no-ops so a sink only implements what it needs.
/// Calls happen inline between steps; a slow sink slows the run.
pub trait ProgressSink: Send + Sync {
    /// A step began processing. Its condition may still skip it.
    fn on_step_start(&self, _event: &WorkflowEvent) {}

    /// A step completed; the event carries timing and summarized output.
    fn on_step_complete(&self, _event: &WorkflowEvent) {}

    /// A step was skipped; the event carries the reason.
    fn on_step_skip(&self, _event: &WorkflowEvent) {}

    /// A step failed; the event tells whether the run continues.
    fn on_step_error(&self, _event: &WorkflowEvent) {}
}

// ---------------------------------------------------------------------------
// ExecuteOptions
// ---------------------------------------------------------------------------

/// Per-run options for `WorkflowRunner::execute`.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Caller-supplied workflow inputs, merged over the definition's
    /// defaults.
    pub inputs: HashMap<String, Value>,
    /// Receives step lifecycle events as the run progresses.
    pub sink: Option<Arc<dyn ProgressSink>>,
    /// Wall-clock budget for the whole run, checked between steps. The run
    /// fails once the budget is exhausted; the step in flight is not
    /// interrupted.
    pub budget: Option<Duration>,
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that refuse or abort a run before it can produce a result.
///
/// Step failures do not surface here: they are recorded in the
/// `ExecutionResult` with a `failed` status.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Strict validation found problems; the run never starts.
    #[error("workflow is invalid: {}", issues_summary(.0))]
    Validation(Vec<ValidationIssue>),

    /// The dependency graph cannot be scheduled.
    #[error("planning error: {0}")]
    Graph(#[from] GraphError),

    /// Building or updating the execution context failed.
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// No live run has this ID.
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Executes workflow definitions against an injected tool backend.
///
/// One runner serves many concurrent runs; per-run state lives on the
/// stack of each `execute` call. Only cancellation tokens are shared,
/// keyed by run ID.
pub struct WorkflowRunner<T: ToolInvoker> {
    invoker: Arc<T>,
    /// Cancellation tokens keyed by run ID.
    cancellations: DashMap<Uuid, CancellationToken>,
}

/// Scheduling data computed once per run.
struct RunPlan<'a> {
    definition: &'a WorkflowDefinition,
    plan: ExecutionPlan,
    deps: BTreeMap<String, BTreeSet<String>>,
    /// Conditional steps gating each branch target.
    gates: BTreeMap<String, BTreeSet<String>>,
}

impl<'a> RunPlan<'a> {
    fn build(definition: &'a WorkflowDefinition) -> Result<Self, GraphError> {
        let deps = build_dependency_graph(definition);
        let plan = plan_from_graph(&definition.steps, &deps)?;
        let gates = conditional_gates(definition);
        Ok(Self {
            definition,
            plan,
            deps,
            gates,
        })
    }

    fn step(&self, id: &str) -> Option<&'a Step> {
        self.definition.step(id)
    }
}

/// What the layer walk produced: terminal status, step records in
/// execution order, and the run-level error message for failed runs.
struct LayerOutcome {
    status: RunStatus,
    steps: Vec<StepRecord>,
    error: Option<String>,
}

impl<T: ToolInvoker> WorkflowRunner<T> {
    pub fn new(invoker: Arc<T>) -> Self {
        Self {
            invoker,
            cancellations: DashMap::new(),
        }
    }

    /// Execute a workflow definition from the beginning.
    ///
    /// Refuses to start when strict validation finds anything or a required
    /// input is missing. Once started, step failures end up in the returned
    /// `ExecutionResult` rather than in `Err`.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        mut options: ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        let issues = validate_strict(definition);
        if !issues.is_empty() {
            return Err(ExecutorError::Validation(issues));
        }

        let run = RunPlan::build(definition)?;
        let run_id = Uuid::now_v7();
        let caller_inputs = std::mem::take(&mut options.inputs);
        let mut ctx = ExecutionContext::new(definition, run_id, caller_inputs)?;

        let cancel = CancellationToken::new();
        self.cancellations.insert(run_id, cancel.clone());

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            layers = run.plan.layers.len(),
            steps = run.plan.step_count(),
            "starting workflow run"
        );

        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = options.budget.map(|budget| start + budget);

        let outcome = self
            .run_layers(&run, &mut ctx, &options, &cancel, deadline)
            .await;
        self.cancellations.remove(&run_id);
        let outcome = outcome?;

        let output = match (&outcome.status, &definition.output) {
            (RunStatus::Completed, Some(expression)) => {
                template::resolve_str(expression, &ctx, &mut BTreeSet::new())
            }
            _ => Value::Null,
        };

        let result = ExecutionResult {
            run_id,
            workflow: definition.name.clone(),
            status: outcome.status,
            output,
            steps: outcome.steps,
            layers: run.plan.layers.len(),
            total_time_ms: start.elapsed().as_millis() as u64,
            started_at,
            finished_at: Utc::now(),
            error: outcome.error,
        };

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            status = ?result.status,
            steps = result.steps.len(),
            total_time_ms = result.total_time_ms,
            "workflow run finished"
        );

        Ok(result)
    }

    /// Cancel a live run. The run stops at the next step boundary and
    /// reports a `cancelled` status.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        if let Some((_, token)) = self.cancellations.remove(&run_id) {
            token.cancel();
            tracing::info!(run_id = %run_id, "workflow run cancelled");
            Ok(())
        } else {
            Err(ExecutorError::RunNotFound(run_id))
        }
    }

    async fn run_layers(
        &self,
        run: &RunPlan<'_>,
        ctx: &mut ExecutionContext,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<LayerOutcome, ExecutorError> {
        let executor = StepExecutor::new(
            Arc::clone(&self.invoker),
            ctx.run_id,
            ctx.workflow.clone(),
            cancel.clone(),
        );
        let mut records: Vec<StepRecord> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut enabled: HashSet<String> = HashSet::new();

        for (layer_idx, layer) in run.plan.layers.iter().enumerate() {
            tracing::debug!(
                run_id = %ctx.run_id,
                layer = layer_idx,
                steps = layer.len(),
                "processing layer"
            );

            for step_id in layer {
                if cancel.is_cancelled() {
                    tracing::info!(run_id = %ctx.run_id, step = %step_id, "run cancelled, stopping");
                    return Ok(LayerOutcome {
                        status: RunStatus::Cancelled,
                        steps: records,
                        error: None,
                    });
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        let message = "wall-clock budget exceeded".to_string();
                        tracing::warn!(run_id = %ctx.run_id, step = %step_id, "{message}");
                        return Ok(LayerOutcome {
                            status: RunStatus::Failed,
                            steps: records,
                            error: Some(message),
                        });
                    }
                }

                // Plan layers only name steps from the definition.
                let Some(step) = run.step(step_id) else {
                    continue;
                };

                // Branch targets stay disabled until a conditional enables
                // them.
                if let Some(gate_ids) = run.gates.get(step_id) {
                    if !enabled.contains(step_id.as_str()) {
                        let named = gate_ids
                            .iter()
                            .map(|id| format!("'{id}'"))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let reason = format!("not enabled by conditional {named}");
                        record_skip(step, reason, ctx, &mut records, &mut skipped, options);
                        continue;
                    }
                }

                // Cascade: a step whose data dependency was skipped is
                // skipped too. Gate edges are not data dependencies.
                let gate_ids = run.gates.get(step_id);
                let skipped_dep = run.deps.get(step_id).into_iter().flatten().find(|dep| {
                    skipped.contains(dep.as_str())
                        && gate_ids.is_none_or(|gates| !gates.contains(dep.as_str()))
                });
                if let Some(dep) = skipped_dep {
                    let reason = format!("dependency '{dep}' was skipped");
                    record_skip(step, reason, ctx, &mut records, &mut skipped, options);
                    continue;
                }

                emit(
                    options,
                    WorkflowEvent::StepStarted {
                        run_id: ctx.run_id,
                        workflow: ctx.workflow.clone(),
                        step_id: step.id.clone(),
                        tool: step.tool,
                        layer: layer_idx,
                    },
                );

                let started = Instant::now();
                match executor.execute(step, &*ctx).await {
                    Ok(StepOutput::Skipped { reason }) => {
                        record_skip(step, reason, ctx, &mut records, &mut skipped, options);
                    }
                    Ok(output) => {
                        if let StepOutput::Branch {
                            enabled: targets, ..
                        } = &output
                        {
                            enabled.extend(targets.iter().cloned());
                        }
                        let time_ms = started.elapsed().as_millis() as u64;
                        let value = output.to_value();
                        ctx.set_step_output(&step.id, value.clone())?;
                        let summary = summarize_value(&value, MAX_EVENT_PAYLOAD_BYTES);
                        records.push(StepRecord {
                            step_id: step.id.clone(),
                            tool: step.tool,
                            status: StepStatus::Completed,
                            time_ms: Some(time_ms),
                            output: Some(summary.clone()),
                            error: None,
                            skip_reason: None,
                        });
                        emit(
                            options,
                            WorkflowEvent::StepCompleted {
                                run_id: ctx.run_id,
                                workflow: ctx.workflow.clone(),
                                step_id: step.id.clone(),
                                tool: step.tool,
                                layer: layer_idx,
                                time_ms,
                                output: summary,
                            },
                        );
                    }
                    // Cancellation observed inside a loop: the in-flight
                    // step records nothing, matching a between-step stop.
                    Err(StepError::Cancelled) => {
                        tracing::info!(
                            run_id = %ctx.run_id,
                            step = %step.id,
                            "run cancelled during step, stopping"
                        );
                        return Ok(LayerOutcome {
                            status: RunStatus::Cancelled,
                            steps: records,
                            error: None,
                        });
                    }
                    Err(err) => {
                        let time_ms = started.elapsed().as_millis() as u64;
                        let message = err.to_string();
                        let continuing = step.continue_on_error && !err.is_fatal();
                        records.push(StepRecord {
                            step_id: step.id.clone(),
                            tool: step.tool,
                            status: StepStatus::Error,
                            time_ms: Some(time_ms),
                            output: None,
                            error: Some(message.clone()),
                            skip_reason: None,
                        });
                        emit(
                            options,
                            WorkflowEvent::StepFailed {
                                run_id: ctx.run_id,
                                workflow: ctx.workflow.clone(),
                                step_id: step.id.clone(),
                                error: message.clone(),
                                continuing,
                            },
                        );
                        if continuing {
                            tracing::warn!(
                                run_id = %ctx.run_id,
                                step = %step.id,
                                error = %message,
                                "step failed, continuing"
                            );
                            ctx.set_step_output(&step.id, json!({ "error": message }))?;
                        } else {
                            tracing::error!(
                                run_id = %ctx.run_id,
                                step = %step.id,
                                error = %message,
                                "step failed, aborting run"
                            );
                            return Ok(LayerOutcome {
                                status: RunStatus::Failed,
                                steps: records,
                                error: Some(format!("step '{}' failed: {message}", step.id)),
                            });
                        }
                    }
                }
            }
        }

        Ok(LayerOutcome {
            status: RunStatus::Completed,
            steps: records,
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Record a skipped step and tell the sink. Skipped steps leave nothing in
/// the context, so their dependents cascade.
fn record_skip(
    step: &Step,
    reason: String,
    ctx: &ExecutionContext,
    records: &mut Vec<StepRecord>,
    skipped: &mut HashSet<String>,
    options: &ExecuteOptions,
) {
    tracing::debug!(run_id = %ctx.run_id, step = %step.id, reason = %reason, "skipping step");
    records.push(StepRecord {
        step_id: step.id.clone(),
        tool: step.tool,
        status: StepStatus::Skipped,
        time_ms: None,
        output: None,
        error: None,
        skip_reason: Some(reason.clone()),
    });
    skipped.insert(step.id.clone());
    emit(
        options,
        WorkflowEvent::StepSkipped {
            run_id: ctx.run_id,
            workflow: ctx.workflow.clone(),
            step_id: step.id.clone(),
            reason,
        },
    );
}

fn emit(options: &ExecuteOptions, event: WorkflowEvent) {
    let Some(sink) = &options.sink else {
        return;
    };
    match &event {
        WorkflowEvent::StepStarted { .. } => sink.on_step_start(&event),
        WorkflowEvent::StepCompleted { .. } => sink.on_step_complete(&event),
        WorkflowEvent::StepSkipped { .. } => sink.on_step_skip(&event),
        WorkflowEvent::StepFailed { .. } => sink.on_step_error(&event),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::workflow::tools::ToolCall;

    /// Echoes resolved inputs back per step, with optional canned outputs
    /// and a step that always fails.
    struct ScriptedInvoker {
        calls: Mutex<Vec<String>>,
        fail_step: Option<String>,
        canned: HashMap<String, Value>,
    }

    impl ScriptedInvoker {
        fn echo() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_step: None,
                canned: HashMap::new(),
            }
        }

        fn failing(step_id: &str) -> Self {
            Self {
                fail_step: Some(step_id.to_string()),
                ..Self::echo()
            }
        }

        fn with_output(mut self, step_id: &str, output: Value) -> Self {
            self.canned.insert(step_id.to_string(), output);
            self
        }

        fn invoked(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolInvoker for ScriptedInvoker {
        fn invoke(&self, call: ToolCall) -> impl Future<Output = anyhow::Result<Value>> + Send {
            self.calls.lock().unwrap().push(call.step_id.clone());
            let outcome = if self.fail_step.as_deref() == Some(call.step_id.as_str()) {
                Err(anyhow::anyhow!("backend unavailable"))
            } else {
                Ok(self
                    .canned
                    .get(&call.step_id)
                    .cloned()
                    .unwrap_or_else(|| json!({ "echo": call.inputs })))
            };
            async move { outcome }
        }
    }

    /// Records event names in arrival order.
    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn on_step_start(&self, event: &WorkflowEvent) {
            self.seen.lock().unwrap().push(format!("start:{}", event.step_id()));
        }
        fn on_step_complete(&self, event: &WorkflowEvent) {
            self.seen.lock().unwrap().push(format!("done:{}", event.step_id()));
        }
        fn on_step_skip(&self, event: &WorkflowEvent) {
            self.seen.lock().unwrap().push(format!("skip:{}", event.step_id()));
        }
        fn on_step_error(&self, event: &WorkflowEvent) {
            self.seen.lock().unwrap().push(format!("fail:{}", event.step_id()));
        }
    }

    fn definition(doc: Value) -> WorkflowDefinition {
        serde_json::from_value(doc).unwrap()
    }

    // -------------------------------------------------------------------
    // Refusal to start
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_refuses_cyclic_definition() {
        let def = definition(json!({
            "name": "cyclic",
            "steps": [
                { "id": "a", "tool": "query", "inputs": { "x": "{{ b.output }}" } },
                { "id": "b", "tool": "query", "inputs": { "x": "{{ a.output }}" } },
            ],
        }));
        let runner = WorkflowRunner::new(Arc::new(ScriptedInvoker::echo()));
        let err = runner.execute(&def, ExecuteOptions::default()).await.unwrap_err();
        match err {
            ExecutorError::Validation(issues) => assert!(!issues.is_empty()),
            other => panic!("expected validation refusal, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_refuses_missing_required_input() {
        let def = definition(json!({
            "name": "needs-query",
            "inputs": { "query": { "type": "string", "required": true } },
            "steps": [
                { "id": "find", "tool": "search", "inputs": { "query": "{{ inputs.query }}" } },
            ],
        }));
        let runner = WorkflowRunner::new(Arc::new(ScriptedInvoker::echo()));
        let err = runner.execute(&def, ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Context(_)));
        assert!(err.to_string().contains("query"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let runner = WorkflowRunner::new(Arc::new(ScriptedInvoker::echo()));
        let err = runner.cancel(Uuid::now_v7()).unwrap_err();
        assert!(matches!(err, ExecutorError::RunNotFound(_)));
    }

    // -------------------------------------------------------------------
    // Happy path
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_chain_resolves_output() {
        let def = definition(json!({
            "name": "research-brief",
            "inputs": { "query": { "type": "string", "required": true } },
            "steps": [
                { "id": "search", "tool": "search",
                  "inputs": { "query": "{{ inputs.query }}" } },
                { "id": "rerank", "tool": "rerank",
                  "inputs": { "hits": "{{ search.output.echo.query }}" } },
                { "id": "brief", "tool": "generate",
                  "inputs": { "text": "{{ rerank.output.echo.hits }}" } },
            ],
            "output": "{{ brief.output.echo.text }}",
        }));
        let invoker = Arc::new(ScriptedInvoker::echo());
        let runner = WorkflowRunner::new(Arc::clone(&invoker));

        let options = ExecuteOptions {
            inputs: HashMap::from([("query".to_string(), json!("rust async"))]),
            ..Default::default()
        };
        let result = runner.execute(&def, options).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.output, json!("rust async"));
        assert_eq!(result.layers, 3);
        assert_eq!(result.workflow, "research-brief");
        assert_eq!(invoker.invoked(), vec!["search", "rerank", "brief"]);

        let ids: Vec<&str> = result.steps.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, vec!["search", "rerank", "brief"]);
        for record in &result.steps {
            assert_eq!(record.status, StepStatus::Completed);
            assert!(record.time_ms.is_some());
            assert!(record.output.is_some());
        }
    }

    #[tokio::test]
    async fn test_event_order_is_deterministic() {
        let def = definition(json!({
            "name": "diamond",
            "steps": [
                { "id": "a", "tool": "search", "inputs": {} },
                { "id": "b", "tool": "rerank", "inputs": { "x": "{{ a.output }}" } },
                { "id": "c", "tool": "embed", "inputs": { "x": "{{ a.output }}" } },
                { "id": "d", "tool": "generate",
                  "inputs": { "left": "{{ b.output }}", "right": "{{ c.output }}" } },
            ],
        }));
        let sink = Arc::new(RecordingSink::default());
        let runner = WorkflowRunner::new(Arc::new(ScriptedInvoker::echo()));

        let options = ExecuteOptions {
            sink: Some(sink.clone()),
            ..Default::default()
        };
        let result = runner.execute(&def, options).await.unwrap();

        assert!(result.is_success());
        assert_eq!(
            sink.events(),
            vec![
                "start:a", "done:a", "start:b", "done:b", "start:c", "done:c", "start:d",
                "done:d",
            ]
        );
    }

    // -------------------------------------------------------------------
    // Skips
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_falsy_condition_cascades_to_dependents() {
        let def = definition(json!({
            "name": "cascade",
            "defaults": { "go": false },
            "steps": [
                { "id": "a", "tool": "search", "inputs": {},
                  "condition": "inputs.go == true" },
                { "id": "b", "tool": "generate", "inputs": { "x": "{{ a.output }}" } },
            ],
        }));
        let invoker = Arc::new(ScriptedInvoker::echo());
        let runner = WorkflowRunner::new(Arc::clone(&invoker));

        let result = runner.execute(&def, ExecuteOptions::default()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(invoker.invoked().is_empty());

        let a = result.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Skipped);
        assert!(a.skip_reason.as_deref().unwrap().contains("condition"));

        let b = result.step("b").unwrap();
        assert_eq!(b.status, StepStatus::Skipped);
        assert_eq!(b.skip_reason.as_deref(), Some("dependency 'a' was skipped"));
    }

    #[tokio::test]
    async fn test_conditional_enables_one_branch() {
        let def = definition(json!({
            "name": "routed",
            "defaults": { "deep": true },
            "steps": [
                { "id": "route", "tool": "conditional",
                  "inputs": { "condition": "inputs.deep == true",
                               "then": ["wide"], "else": ["quick"] } },
                { "id": "wide", "tool": "search", "inputs": {} },
                { "id": "quick", "tool": "query", "inputs": {} },
                { "id": "summary", "tool": "generate",
                  "inputs": { "x": "{{ quick.output }}" } },
            ],
        }));
        let invoker = Arc::new(ScriptedInvoker::echo());
        let runner = WorkflowRunner::new(Arc::clone(&invoker));

        let result = runner.execute(&def, ExecuteOptions::default()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.step("route").unwrap().status, StepStatus::Completed);
        assert_eq!(result.step("wide").unwrap().status, StepStatus::Completed);

        let quick = result.step("quick").unwrap();
        assert_eq!(quick.status, StepStatus::Skipped);
        assert_eq!(
            quick.skip_reason.as_deref(),
            Some("not enabled by conditional 'route'")
        );

        // `summary` needed quick's output, which never materialized.
        let summary = result.step("summary").unwrap();
        assert_eq!(summary.status, StepStatus::Skipped);
        assert_eq!(
            summary.skip_reason.as_deref(),
            Some("dependency 'quick' was skipped")
        );

        assert_eq!(invoker.invoked(), vec!["wide"]);
    }

    // -------------------------------------------------------------------
    // Failures
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_continue_on_error_records_marker() {
        let def = definition(json!({
            "name": "tolerant",
            "steps": [
                { "id": "flaky", "tool": "search", "inputs": {},
                  "continueOnError": true },
                { "id": "reader", "tool": "generate",
                  "inputs": { "seen": "{{ flaky.output.error }}" } },
            ],
        }));
        let invoker = Arc::new(ScriptedInvoker::failing("flaky"));
        let runner = WorkflowRunner::new(Arc::clone(&invoker));

        let result = runner.execute(&def, ExecuteOptions::default()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.error.is_none());

        let flaky = result.step("flaky").unwrap();
        assert_eq!(flaky.status, StepStatus::Error);
        assert!(flaky.error.as_deref().unwrap().contains("backend unavailable"));

        // The dependent ran and saw the error marker through the context.
        let reader = result.step("reader").unwrap();
        assert_eq!(reader.status, StepStatus::Completed);
        let echoed = reader.output.as_ref().unwrap();
        assert!(
            echoed["echo"]["seen"]
                .as_str()
                .unwrap()
                .contains("backend unavailable")
        );
    }

    #[tokio::test]
    async fn test_fatal_step_failure_aborts_run() {
        let def = definition(json!({
            "name": "brittle",
            "steps": [
                { "id": "a", "tool": "search", "inputs": {} },
                { "id": "b", "tool": "generate", "inputs": { "x": "{{ a.output }}" } },
            ],
            "output": "{{ a.output }}",
        }));
        let sink = Arc::new(RecordingSink::default());
        let runner = WorkflowRunner::new(Arc::new(ScriptedInvoker::failing("a")));

        let options = ExecuteOptions {
            sink: Some(sink.clone()),
            ..Default::default()
        };
        let result = runner.execute(&def, options).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("step 'a' failed"));
        // The run aborted before `b`; failed runs resolve no output.
        assert!(result.step("b").is_none());
        assert_eq!(result.output, Value::Null);
        assert_eq!(sink.events(), vec!["start:a", "fail:a"]);
    }

    #[tokio::test]
    async fn test_loop_bound_is_fatal_despite_continue_on_error() {
        let def = definition(json!({
            "name": "unbounded",
            "defaults": { "many": (0..150).collect::<Vec<u32>>() },
            "steps": [
                { "id": "fan", "tool": "embed", "inputs": { "value": "{{ item }}" },
                  "forEach": "inputs.many", "continueOnError": true },
                { "id": "after", "tool": "generate", "inputs": { "x": "{{ fan.output }}" } },
            ],
        }));
        let invoker = Arc::new(ScriptedInvoker::echo());
        let runner = WorkflowRunner::new(Arc::clone(&invoker));

        let result = runner.execute(&def, ExecuteOptions::default()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("iteration cap"));
        // Refused before the first iteration.
        assert!(invoker.invoked().is_empty());
        assert_eq!(result.step("fan").unwrap().status, StepStatus::Error);
        assert!(result.step("after").is_none());
    }

    // -------------------------------------------------------------------
    // Cancellation and budget
    // -------------------------------------------------------------------

    struct CancelAfterFirst {
        runner: Arc<WorkflowRunner<ScriptedInvoker>>,
    }

    impl ProgressSink for CancelAfterFirst {
        fn on_step_complete(&self, event: &WorkflowEvent) {
            let _ = self.runner.cancel(event.run_id());
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_at_step_boundary() {
        let def = definition(json!({
            "name": "cancellable",
            "steps": [
                { "id": "first", "tool": "search", "inputs": {} },
                { "id": "second", "tool": "generate", "inputs": { "x": "{{ first.output }}" } },
            ],
        }));
        let invoker = Arc::new(ScriptedInvoker::echo());
        let runner = Arc::new(WorkflowRunner::new(Arc::clone(&invoker)));

        let options = ExecuteOptions {
            sink: Some(Arc::new(CancelAfterFirst {
                runner: Arc::clone(&runner),
            })),
            ..Default::default()
        };
        let result = runner.execute(&def, options).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.step("first").unwrap().status, StepStatus::Completed);
        assert!(result.step("second").is_none());
        assert_eq!(invoker.invoked(), vec!["first"]);
    }

    /// Cancels its own run from inside the first tool call.
    struct SelfCancellingInvoker {
        runner: Mutex<Option<Arc<WorkflowRunner<SelfCancellingInvoker>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ToolInvoker for SelfCancellingInvoker {
        fn invoke(&self, call: ToolCall) -> impl Future<Output = anyhow::Result<Value>> + Send {
            self.calls.lock().unwrap().push(call.step_id.clone());
            if let Some(runner) = self.runner.lock().unwrap().as_ref() {
                let _ = runner.cancel(call.run_id);
            }
            async move { Ok(json!({ "ok": true })) }
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_between_loop_iterations() {
        let def = definition(json!({
            "name": "fan-cancel",
            "defaults": { "batch": ["a", "b", "c"] },
            "steps": [
                { "id": "fan", "tool": "embed", "inputs": { "value": "{{ item }}" },
                  "forEach": "inputs.batch" },
            ],
        }));
        let invoker = Arc::new(SelfCancellingInvoker {
            runner: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        });
        let runner = Arc::new(WorkflowRunner::new(Arc::clone(&invoker)));
        *invoker.runner.lock().unwrap() = Some(Arc::clone(&runner));

        let result = runner.execute(&def, ExecuteOptions::default()).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        // The first iteration ran; the boundary check stopped the rest.
        assert_eq!(invoker.calls.lock().unwrap().len(), 1);
        // The in-flight step never completed, so it recorded nothing.
        assert!(result.step("fan").is_none());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_run() {
        let def = definition(json!({
            "name": "budgeted",
            "steps": [
                { "id": "slow", "tool": "search", "inputs": {} },
            ],
        }));
        let invoker = Arc::new(ScriptedInvoker::echo());
        let runner = WorkflowRunner::new(Arc::clone(&invoker));

        let options = ExecuteOptions {
            budget: Some(Duration::ZERO),
            ..Default::default()
        };
        let result = runner.execute(&def, options).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("budget"));
        assert!(result.steps.is_empty());
        assert!(invoker.invoked().is_empty());
    }

    // -------------------------------------------------------------------
    // Payload summarization
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_large_outputs_summarized_in_records() {
        let big = "x".repeat(10_000);
        let def = definition(json!({
            "name": "bulky",
            "steps": [
                { "id": "big", "tool": "search", "inputs": {} },
            ],
            "output": "{{ big.output }}",
        }));
        let invoker = ScriptedInvoker::echo().with_output("big", json!(big.clone()));
        let runner = WorkflowRunner::new(Arc::new(invoker));

        let result = runner.execute(&def, ExecuteOptions::default()).await.unwrap();

        assert!(result.is_success());
        // Record payload carries the truncation marker.
        let record = result.step("big").unwrap().output.as_ref().unwrap();
        assert_eq!(record["_truncated"], json!(true));
        assert!(record["_preview"].is_string());
        // The context kept the full value for downstream resolution.
        assert_eq!(result.output, json!(big));
    }
}
