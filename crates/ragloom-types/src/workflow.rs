//! Workflow domain types for Ragloom.
//!
//! Defines the canonical document model for workflows: a JSON definition
//! (steps, declared inputs, defaults, output expression) plus the run-facing
//! records (`ExecutionResult`, `StepRecord`) produced by each execution.
//! Definition fields serialize camelCase to match the authored JSON schema
//! (`forEach`, `continueOnError`, `maxIterations`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical document model)
// ---------------------------------------------------------------------------

/// A declarative workflow definition.
///
/// Immutable once loaded: validated once, then reused across executions.
/// `steps` preserves authoring order; execution order comes from the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow name (used in events and run records).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Version string (e.g. "1.0.0").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Declared inputs: name -> spec (type, required, default).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputSpec>,
    /// Default values merged into the `inputs` scope beneath caller values.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub defaults: HashMap<String, Value>,
    /// Ordered step definitions forming the workflow DAG.
    pub steps: Vec<Step>,
    /// Template expression selecting the final result (absent -> null output).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// All step IDs in authoring order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }
}

/// Declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    /// Advisory type label (e.g. "string", "number"); not enforced.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_label: Option<String>,
    /// Whether the caller must supply this input (or a default must exist).
    #[serde(default)]
    pub required: bool,
    /// Default value applied when the caller omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Optional description for editors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// User-defined step ID (e.g. "rerank-hits"). Unique within a workflow.
    pub id: String,
    /// The tool this step invokes.
    pub tool: ToolKind,
    /// Human-readable step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tool parameters: literal values or `{{ expr }}` template expressions,
    /// possibly nested in objects/arrays.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, Value>,
    /// Boolean expression gating execution; falsy -> step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Expression resolving to an array; when present (and the tool is not
    /// `loop`) the step runs once per element with `item` bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    /// On failure, record an error marker and keep executing the run.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// The fixed set of tools a step can invoke.
///
/// `merge`, `filter`, `transform`, `conditional`, `loop`, and `template` are
/// engine-native (their semantics are part of the scheduling contract); the
/// rest are delegated to the injected tool collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Query,
    Search,
    Rerank,
    Embed,
    Similarity,
    Generate,
    Ingest,
    Collections,
    Models,
    Estimate,
    Explain,
    Topics,
    Aggregate,
    Http,
    Merge,
    Filter,
    Transform,
    Conditional,
    Loop,
    Template,
    Chunk,
}

impl ToolKind {
    /// Whether this tool is implemented inside the engine (control flow and
    /// text composition) rather than delegated to the collaborator.
    pub fn is_engine_native(&self) -> bool {
        matches!(
            self,
            ToolKind::Merge
                | ToolKind::Filter
                | ToolKind::Transform
                | ToolKind::Conditional
                | ToolKind::Loop
                | ToolKind::Template
        )
    }

    /// Lowercase wire name of the tool.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Query => "query",
            ToolKind::Search => "search",
            ToolKind::Rerank => "rerank",
            ToolKind::Embed => "embed",
            ToolKind::Similarity => "similarity",
            ToolKind::Generate => "generate",
            ToolKind::Ingest => "ingest",
            ToolKind::Collections => "collections",
            ToolKind::Models => "models",
            ToolKind::Estimate => "estimate",
            ToolKind::Explain => "explain",
            ToolKind::Topics => "topics",
            ToolKind::Aggregate => "aggregate",
            ToolKind::Http => "http",
            ToolKind::Merge => "merge",
            ToolKind::Filter => "filter",
            ToolKind::Transform => "transform",
            ToolKind::Conditional => "conditional",
            ToolKind::Loop => "loop",
            ToolKind::Template => "template",
            ToolKind::Chunk => "chunk",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy for the `merge` tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Append sources in order.
    #[default]
    Concat,
    /// Round-robin across sources.
    Interleave,
    /// De-duplicate by structural equality, preserving first-seen order.
    Unique,
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// Terminal status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Terminal status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Error,
}

/// Per-step record in an `ExecutionResult`.
///
/// `output` is a summarized payload (large values carry a truncation marker);
/// the full value lives only in the execution context during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub tool: ToolKind,
    pub status: StepStatus,
    /// Wall-clock execution time; absent for skipped steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// Result of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// UUIDv7 run ID, time-sortable.
    pub run_id: Uuid,
    /// Name of the executed workflow.
    pub workflow: String,
    pub status: RunStatus,
    /// The definition's `output` expression resolved against the final
    /// context; null when absent, failed, or cancelled early.
    pub output: Value,
    /// Per-step records in execution order (attempted and skipped steps).
    pub steps: Vec<StepRecord>,
    /// Number of layers in the execution plan.
    pub layers: usize,
    pub total_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Run-level error message when the status is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Whether the run finished all layers successfully.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Look up a step record by step ID.
    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
