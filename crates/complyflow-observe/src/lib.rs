//! Observability setup for ComplyFlow: structured logging and optional
//! OpenTelemetry trace export.

pub mod tracing_setup;
