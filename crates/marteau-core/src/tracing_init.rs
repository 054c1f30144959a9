//! Tracing setup for Marteau binaries.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid, e.g.
/// `"marteau_worker=info"`. With `log_json` every event is one JSON line.
/// Output goes to stderr; stdout carries echoed console output and command
/// results.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let layer = if log_json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
}
