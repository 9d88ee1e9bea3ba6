//! Tracing subscriber setup for the binary.
//!
//! Filter precedence: `CONDUCTOR_LOG`, then `RUST_LOG`, then the level
//! implied by `--verbose`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_ENV: &str = "CONDUCTOR_LOG";
pub const LOG_FILE: &str = "conductor.log";

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "conductor=debug,info" } else { "info" }
}

/// Build the filter from the environment, falling back to the verbosity default.
pub fn env_filter(verbose: bool) -> EnvFilter {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber.
///
/// Console output goes to stderr so command output on stdout stays
/// machine-readable. With `log_dir`, a JSON copy of every event is appended
/// to `conductor.log` there; keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init(verbose: bool, json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let console = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match log_dir.map(|dir| std::fs::create_dir_all(dir).map(|()| dir)) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("warning: could not create log directory: {}", e);
            (None, None)
        }
        None => (None, None),
    };

    // A subscriber installed earlier (tests, embedding) wins.
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(console)
        .with(file_layer)
        .try_init();

    guard
}
