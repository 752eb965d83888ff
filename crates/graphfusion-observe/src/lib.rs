//! Observability setup for GraphFusion: a `tracing` subscriber with
//! structured output and optional OpenTelemetry span export.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingError, init_tracing, shutdown_tracing};
