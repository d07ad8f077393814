//! Logging support for rexhibit
//!
//! Logs go to stderr by default, or to the file named by `[logging]
//! log_file`. The filter comes from RUST_LOG when it is set, otherwise from
//! `[logging] filter`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "warn";

/// Initialize the logging system
///
/// Returns the guard of the file writer, which must stay alive until the
/// program exits so buffered lines get flushed. `None` when logging to stderr.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config, verbose)?;

    match &config.log_file {
        Some(log_file) => {
            let (directory, file_name) = split_log_path(Path::new(log_file))?;
            fs::create_dir_all(&directory)
                .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

            let appender = tracing_appender::rolling::never(&directory, &file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            registry()
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_thread_ids(true)
                        .with_file(false)
                        .with_line_number(false),
                )
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

            Ok(Some(guard))
        }
        None => {
            registry()
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_file(false)
                        .with_line_number(false),
                )
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

            Ok(None)
        }
    }
}

/// RUST_LOG wins over the configured filter; `verbose` raises the default to debug
fn build_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directive = if verbose {
        "rexhibit=debug"
    } else {
        config.logging_filter()
    };
    EnvFilter::try_new(directive).with_context(|| format!("Invalid logging filter: {}", directive))
}

fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("Log file path has no file name: {}", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, file_name))
}

impl LoggingConfig {
    /// Configured filter directive, falling back to `warn`
    pub fn logging_filter(&self) -> &str {
        self.filter.as_deref().unwrap_or(DEFAULT_FILTER)
    }
}
