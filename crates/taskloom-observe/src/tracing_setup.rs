//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use taskloom_types::config::LogConfig;
//!
//! taskloom_observe::tracing_setup::init_tracing(&LogConfig::default()).unwrap();
//! // ... run ...
//! taskloom_observe::tracing_setup::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use taskloom_types::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Filter directive for the CLI verbosity flags.
///
/// No flags keeps the configured level; `--quiet` drops to errors, `-v`
/// turns on engine debug logs and `-vv` traces everything.
pub fn filter_for_verbosity(verbose: u8, quiet: bool, configured: &str) -> String {
    match verbose {
        0 if quiet => "error".to_string(),
        0 => configured.to_string(),
        1 => "info,taskloom_core=debug,taskloom_infra=debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Initialize the global tracing subscriber.
///
/// - `RUST_LOG` wins over `config.level` when set.
/// - `config.format` picks human-readable or JSON lines output.
/// - `config.otel` additionally bridges spans to OpenTelemetry using the
///   stdout exporter.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set or the
/// filter directive does not parse.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let (json_layer, pretty_layer) = match config.format {
        LogFormat::Json => (
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
            None,
        ),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().with_target(false))),
    };

    let otel_layer = config.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("taskloom");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
