use std::panic;
use std::path::Path;
use tracing::error;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_error::ErrorLayer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*, registry::Registry};

/// Install the global tracing subscriber.
///
/// Stdout fmt layer plus, when `log_dir` is given, a daily-rolling file
/// layer. Returns the appender guard; dropping it stops the background
/// writer, so the host should hold it for the process lifetime.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_ansi(true)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    match log_dir {
        Some(dir) => {
            let error_layer = ErrorLayer::default();
            let file_appender = rolling::daily(dir, "logfile_agent.log");
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking_writer)
                .with_target(false)
                .with_timer(fmt::time::UtcTime::rfc_3339());

            let subscriber = Registry::default()
                .with(filter)
                .with(fmt_layer)
                .with(file_layer)
                .with(error_layer);

            if tracing::subscriber::set_global_default(subscriber).is_err() {
                tracing::debug!("Global tracing subscriber was already set");
            }
            Some(guard)
        }
        None => {
            let error_layer = ErrorLayer::default();
            let subscriber = Registry::default()
                .with(filter)
                .with(fmt_layer)
                .with(error_layer);

            if tracing::subscriber::set_global_default(subscriber).is_err() {
                tracing::debug!("Global tracing subscriber was already set");
            }
            None
        }
    }
}

pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => *s,
            None => "Unknown panic",
        };

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
