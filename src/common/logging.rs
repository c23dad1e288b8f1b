//! Logging and tracing configuration
//!
//! The server logs to stderr, and optionally appends to a log file so a
//! long cucumber run can be inspected afterwards.

use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Initialize tracing for the server
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
/// Returns the path of the log file, if one could be opened.
pub fn init(log_file: Option<&Path>) -> Option<PathBuf> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cukemerlin=info,warn"));

    if let Some(path) = log_file {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => {
                let file_layer = fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true);

                let stderr_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .compact();

                tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(stderr_layer)
                    .init();

                return Some(path.to_path_buf());
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {}: {}", path.display(), e);
            }
        }
    }

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .init();

    None
}

/// Default location for the server log file
pub fn default_log_path() -> Option<PathBuf> {
    paths::log_dir().map(|d| d.join("cukemerlin.log"))
}
