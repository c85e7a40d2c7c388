//! Workflow engine core: definition validation, dependency planning, and
//! layer-ordered execution.
//!
//! This module contains the "brain" of the workflow engine:
//! - `definition` -- JSON parsing, validation gate, filesystem load/save
//! - `expr` -- typed expression parser and evaluator for conditions and paths
//! - `template` -- `{{ ... }}` marker resolution against a scope
//! - `context` -- execution context: merged inputs plus write-once step outputs
//! - `graph` -- dependency discovery, cycle detection, layer computation
//! - `validate` -- structural checks; errors refuse a run, warnings advise
//! - `tools` -- per-step execution: engine-native tools and delegated dispatch
//! - `runner` -- run-level orchestration, cancellation, progress events

pub mod context;
pub mod definition;
pub mod expr;
pub mod graph;
pub mod runner;
pub mod template;
pub mod tools;
pub mod validate;
