//! Workflow execution engine for Ragloom.
//!
//! Runs declarative JSON workflows against a retrieval/generation tool
//! backend. Dependencies between steps are discovered from `{{ ... }}`
//! template references, layered into an execution plan, and walked in order
//! by `workflow::runner::WorkflowRunner`. Control-flow tools (`merge`,
//! `filter`, `transform`, `conditional`, `loop`, `template`) execute inside
//! the engine; everything else is delegated through the
//! `workflow::tools::ToolInvoker` trait.
//!
//! This crate depends only on `ragloom-types` -- never on HTTP, storage, or
//! model-serving crates. Backends plug in from the outside.

pub mod event;
pub mod workflow;
