//! Tracing subscriber initialization with optional OpenTelemetry export.
//!
//! ```no_run
//! // Structured logging at the CLI's chosen verbosity
//! taskloom_observe::init_tracing("warn", false).unwrap();
//!
//! // Also export spans to stdout through OpenTelemetry
//! taskloom_observe::init_tracing("info,taskloom=debug", true).unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Tracer name reported on exported spans.
pub const TRACER_NAME: &str = "taskloom";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Filter from `RUST_LOG`, or `default_directives` when it is unset or invalid.
pub fn env_filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}

/// Install the global subscriber.
///
/// Always adds an `fmt` layer writing to stderr with span-close timing.
/// With `enable_otel`, spans are also bridged to OpenTelemetry and exported
/// to stdout.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_tracing(default_directives: &str, enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(enable_otel)
        .with_span_events(FmtSpan::CLOSE);
    let filter = env_filter(default_directives);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Flush and shut down the OpenTelemetry provider, if one was installed.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_without_otel_is_a_noop() {
        shutdown_tracing();
    }

    #[test]
    fn default_directives_parse() {
        for directives in ["error", "warn", "info,taskloom=debug", "trace"] {
            let filter = EnvFilter::new(directives);
            assert!(!filter.to_string().is_empty());
        }
    }
}
