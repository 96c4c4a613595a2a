//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use helix_observe::tracing_setup::{TracingOptions, init_tracing};
//!
//! // Human-readable logs
//! init_tracing(TracingOptions::default()).unwrap();
//!
//! // JSON logs plus spans exported to stdout
//! init_tracing(TracingOptions { json: true, otel: true, ..Default::default() }).unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Selects `json` log output when set to `json`.
pub const LOG_FORMAT_ENV: &str = "HELIX_LOG_FORMAT";
/// Enables the OpenTelemetry stdout exporter when set to `1` or `true`.
pub const OTEL_ENV: &str = "HELIX_OTEL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            json: false,
            otel: false,
            default_filter: "info".to_string(),
        }
    }
}

impl TracingOptions {
    /// Read [`LOG_FORMAT_ENV`] and [`OTEL_ENV`].
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var(LOG_FORMAT_ENV).ok().as_deref(),
            std::env::var(OTEL_ENV).ok().as_deref(),
        )
    }

    fn from_vars(format: Option<&str>, otel: Option<&str>) -> Self {
        Self {
            json: format.is_some_and(|f| f.eq_ignore_ascii_case("json")),
            otel: otel.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            ..Self::default()
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer (plain or JSON) with target visibility and span
///   close timing.
/// - When `options.otel` is set, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter.
/// - Respects `RUST_LOG`, falling back to `options.default_filter`.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(options: TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.default_filter))?;

    let (plain_layer, json_layer) = if options.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE);
        (None, Some(layer))
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);
        (Some(layer), None)
    };

    let otel_layer = if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("helix");

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Safe to call even when OTel was not enabled (no-op in that case).
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
    fn options_from_vars() {
        assert_eq!(TracingOptions::from_vars(None, None), TracingOptions::default());

        let opts = TracingOptions::from_vars(Some("JSON"), Some("true"));
        assert!(opts.json);
        assert!(opts.otel);

        let opts = TracingOptions::from_vars(Some("pretty"), Some("0"));
        assert!(!opts.json);
        assert!(!opts.otel);
    }

    #[test]
    fn shutdown_without_init_is_noop() {
        shutdown_tracing();
    }
}
