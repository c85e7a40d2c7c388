//! Shared domain types for Ragloom.
//!
//! This crate contains the workflow document model (definitions, steps,
//! tools), the run records produced by each execution, and the progress
//! events streamed to callers.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod event;
pub mod workflow;
