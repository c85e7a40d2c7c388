//! Observability setup for Ragloom.
//!
//! Subscriber initialization for structured logging with optional
//! OpenTelemetry trace export. Binaries embedding the engine call
//! `tracing_setup::init_tracing` once at startup and
//! `tracing_setup::shutdown_tracing` before exit.

pub mod tracing_setup;
