//!
//! src/logging.rs  Andrew Belles  Oct 17th, 2026
//!
//! Initializes logger so the recorder gives informative, structured
//! output while it runs
//!
//!

use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tracing_error::ErrorLayer;
use tracing_appender::non_blocking;

use crate::config::{LogFormat, LoggingConfig};

/// Keeps the non-blocking writer flushing until dropped at exit
pub struct LoggingGuard(tracing_appender::non_blocking::WorkerGuard);

pub fn init_logging(cfg: &LoggingConfig) ->
    Result<LoggingGuard, crate::errors::SetListError> {

    let (writer, guard) = non_blocking(std::io::stdout());
    let filter = std::env::var("RUST_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(cfg.filter_directives.clone()));

    let time = tracing_subscriber::fmt::time::UtcTime::rfc_3339();
    let base = fmt::layer()
        .with_writer(writer)
        .with_timer(time)
        .with_ansi(cfg.with_ansi)
        .with_target(cfg.include_target)
        .with_file(cfg.include_file_line)
        .with_line_number(cfg.include_file_line);

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default());

    let installed = match cfg.format {
        LogFormat::Json => registry
            .with(base.json().flatten_event(true).with_current_span(true).with_span_list(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(base.pretty())
            .try_init()
    };

    installed.map_err(|e| crate::errors::SetListError::Config(
        format!("logger already installed: {e}")
    ))?;
    Ok( LoggingGuard(guard) )
}
