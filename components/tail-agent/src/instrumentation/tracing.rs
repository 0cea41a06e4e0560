// Local crates
use crate::helpers::load_config::InstrumentationConfig;

// External crates
use anyhow::{Context, Result};
use console_subscriber::ConsoleLayer;
use std::panic;
use tracing::error;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    Layer,
    filter::{Directive, EnvFilter},
    fmt,
    prelude::*,
    registry::Registry,
};

const LOG_FILE_PREFIX: &str = "ves_tail.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `instrumentation.level`. The returned guard flushes
/// the rolling file writer and must be held until the process exits.
pub fn init_tracing(cfg: &InstrumentationConfig) -> Result<Option<WorkerGuard>> {
    let mut filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.level)
            .with_context(|| format!("Invalid instrumentation.level {:?}", cfg.level))?,
    };

    let console_layer = if cfg.tokio_console {
        for directive in ["tokio=trace", "runtime=trace"] {
            if let Ok(directive) = directive.parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }
        Some(ConsoleLayer::builder().spawn())
    } else {
        None
    };

    let stdout_layer = if cfg.json {
        fmt::layer()
            .json()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .boxed()
    };

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE_PREFIX));
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_timer(fmt::time::UtcTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(console_layer)
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(ErrorLayer::default())
        .try_init()
        .context("Failed to set global tracing subscriber")?;

    Ok(guard)
}

/// Route panics through `tracing` so they reach every configured output.
pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Unknown panic");

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message = %msg,
            location = %location,
            "Application panicked!"
        );
    }));
}
