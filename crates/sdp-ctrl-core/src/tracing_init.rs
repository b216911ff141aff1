//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter, optional JSON output and an
//! optional log file. A detached daemon has no standard streams left, so the
//! log file is the only place its output can go.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"sdp_ctrl_client=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
/// * `log_file` -- append to this file instead of writing to stderr.
pub fn init_tracing(
    default_filter: &str,
    log_json: bool,
    log_file: Option<&Path>,
) -> std::io::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );

    let registry = tracing_subscriber::registry().with(env_filter);

    match (log_file, log_json) {
        (Some(path), json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o600)
                .open(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            if json {
                registry.with(layer.json()).init();
            } else {
                registry.with(layer).init();
            }
        }
        (None, true) => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        (None, false) => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
    Ok(())
}
