use eyre::{Result, WrapErr};
use http::StatusCode;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Initialize tracing from the environment's logging section.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    init_tracing_with_config(&logging.level, logging.format == LogFormat::Json, true)
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    }

    tracing::info!(level, json = json_format, "Logging initialized");
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str, route: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        http.route = route,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Emit the per-request completion event at a level matching the status
/// class: 5xx as errors, 4xx as warnings, everything else as info.
pub fn log_response(status: StatusCode, duration_ms: u64, message: &str) {
    let status_code = status.as_u16();
    let span = tracing::Span::current();
    span.record("http.status_code", status_code);
    span.record("duration_ms", duration_ms);

    if status.is_server_error() {
        tracing::error!(status_code, duration_ms, "{message}");
    } else if status.is_client_error() {
        tracing::warn!(status_code, duration_ms, "{message}");
    } else {
        tracing::info!(status_code, duration_ms, "{message}");
    }
}
