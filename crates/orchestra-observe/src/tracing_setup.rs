//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! The engine itself only emits `tracing` events and spans; whichever process
//! embeds it calls [`init_tracing`] once at startup and [`shutdown_tracing`]
//! before exit.
//!
//! ```no_run
//! orchestra_observe::init_tracing(false).unwrap();
//! // ... run workflows ...
//! orchestra_observe::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Instrumentation scope name reported on exported spans.
pub const TRACER_NAME: &str = "orchestra";

/// Directive used when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVE: &str = "info";

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("global tracing subscriber already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global tracing subscriber.
///
/// - Always installs a `fmt` layer with targets and span close timing.
/// - `RUST_LOG` selects levels; without it everything at `info` and above
///   is shown.
/// - With `enable_otel`, spans (including the per-execution and per-step
///   spans the engine opens) are also bridged to OpenTelemetry through a
///   stdout exporter.
///
/// # Errors
///
/// Returns [`TracingError::AlreadyInitialized`] if a global subscriber is
/// already set. Tracing keeps working through the existing one.
pub fn init_tracing(enable_otel: bool) -> Result<(), TracingError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    tracing::debug!(otel = enable_otel, "tracing initialized");
    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        eprintln!("Warning: OTel tracer provider shutdown error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_already_initialized() {
        // The first call may lose to another test binary thread; either way
        // a global subscriber exists afterwards.
        let _ = init_tracing(false);
        let err = init_tracing(false).unwrap_err();
        assert!(matches!(err, TracingError::AlreadyInitialized(_)));
        assert!(err.to_string().contains("already installed"));
    }

    #[test]
    fn shutdown_without_otel_is_noop() {
        shutdown_tracing();
    }
}
