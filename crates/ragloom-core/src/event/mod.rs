//! Progress event distribution.
//!
//! Provides an `EventBus` that fans `WorkflowEvent` messages out to all
//! subscribers via a `tokio::sync::broadcast` channel, and a `BusSink`
//! adapter feeding the bus from a run's progress callbacks.

pub mod bus;

pub use bus::{BusSink, EventBus};
