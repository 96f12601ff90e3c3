//! Observability setup for Orchestra: structured logging through `tracing`
//! with optional OpenTelemetry span export.

pub mod tracing_setup;

pub use tracing_setup::{TracingError, init_tracing, shutdown_tracing};
