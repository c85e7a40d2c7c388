//! Progress events emitted during workflow execution.
//!
//! `WorkflowEvent` is the unified event type the orchestrator hands to its
//! progress sink, one variant per lifecycle callback. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels, and serialize
//! with a `type` tag so front-ends can stream them as server-sent events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::ToolKind;

/// Events emitted around each step of a workflow run.
///
/// Payloads carried by `StepCompleted` are summarized (large values are
/// replaced by a truncation marker) to bound transport size; the execution
/// context keeps the full values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// A step is about to execute.
    #[serde(rename_all = "camelCase")]
    StepStarted {
        run_id: Uuid,
        workflow: String,
        step_id: String,
        tool: ToolKind,
        /// Zero-based index of the plan layer containing this step.
        layer: usize,
    },

    /// A step finished successfully.
    #[serde(rename_all = "camelCase")]
    StepCompleted {
        run_id: Uuid,
        workflow: String,
        step_id: String,
        tool: ToolKind,
        layer: usize,
        time_ms: u64,
        /// Summarized step output.
        output: Value,
    },

    /// A step was skipped (falsy condition, or cascaded from a skipped
    /// dependency, or never enabled by its gating conditional).
    #[serde(rename_all = "camelCase")]
    StepSkipped {
        run_id: Uuid,
        workflow: String,
        step_id: String,
        reason: String,
    },

    /// A step failed.
    #[serde(rename_all = "camelCase")]
    StepFailed {
        run_id: Uuid,
        workflow: String,
        step_id: String,
        error: String,
        /// Whether the run continues (`continueOnError`) after this failure.
        continuing: bool,
    },
}

impl WorkflowEvent {
    /// The step ID this event concerns.
    pub fn step_id(&self) -> &str {
        match self {
            WorkflowEvent::StepStarted { step_id, .. }
            | WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepSkipped { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. } => step_id,
        }
    }

    /// The run ID this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. } => *run_id,
        }
    }
}
