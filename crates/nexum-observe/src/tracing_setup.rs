//! Tracing subscriber setup driven by the `[tracing]` table of `worker.toml`.
//!
//! Worker dispatches run inside a `task` span carrying `workflow_id`,
//! `execution_id`, `node_id` and `task_id`. With `span_timing` on, every
//! dispatch logs its duration when the span closes.
//!
//! # Usage
//!
//! ```no_run
//! use nexum_types::worker::TracingConfig;
//!
//! let _guard = nexum_observe::tracing_setup::init_tracing(&TracingConfig::default())
//!     .expect("install subscriber");
//! // Spans are flushed when `_guard` is dropped.
//! ```

use nexum_types::worker::TracingConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Tracer name reported to OpenTelemetry.
pub const TRACER_NAME: &str = "nexum";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid log filter {directives:?}: {source}")]
    Filter {
        directives: String,
        #[source]
        source: ParseError,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Flushes and shuts down span export when dropped.
#[must_use = "dropping the guard shuts down span export"]
#[derive(Debug)]
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// Whether spans are being exported through OpenTelemetry.
    pub fn exports_spans(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Warning: OTel tracer provider shutdown error: {e}");
            }
        }
    }
}

/// Filter directives in effect: a non-blank `RUST_LOG` wins over the config.
pub fn log_filter(config: &TracingConfig, rust_log: Option<&str>) -> Result<EnvFilter, TracingError> {
    let directives = rust_log
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(config.filter.as_str());
    EnvFilter::try_new(directives).map_err(|source| TracingError::Filter {
        directives: directives.to_string(),
        source,
    })
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Fails on unparseable filter directives, or if a global subscriber is
/// already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<TracingGuard, TracingError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = log_filter(config, rust_log.as_deref())?;

    let span_events = if config.span_timing {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(span_events);

    let provider = config.otel_stdout.then(|| {
        SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build()
    });
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(TRACER_NAME)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(provider) = &provider {
        opentelemetry::global::set_tracer_provider(provider.clone());
    }
    tracing::info!(
        filter = %config.filter,
        otel_stdout = config.otel_stdout,
        "tracing initialized"
    );
    Ok(TracingGuard { provider })
}
