//! Logging bootstrap.
//!
//! Installs a `tracing` subscriber that writes to stderr and, when a log
//! directory is configured, to a daily rolling file through a non-blocking
//! writer. `RUST_LOG` takes precedence over the configured level.
//!
//! ```ignore
//! let _guard = tilevault::logging::init_logging(&LoggingConfig::default())?;
//! ```
//!
//! Keep the returned guard alive for the life of the program; dropping it
//! flushes and stops the file writer.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub use tracing_appender::non_blocking::WorkerGuard;

/// Default log filter.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log file name prefix; the date is appended by the appender.
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tilevault.log";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter {filter:?}: {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// The `"logging"` config object.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `"info"` or `"tilevault=debug"`.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for rolling log files; stderr only when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_prefix", rename = "file prefix", alias = "file_prefix")]
    pub file_prefix: String,
}

fn default_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_prefix() -> String {
    DEFAULT_LOG_FILE_PREFIX.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directory: None,
            file_prefix: default_prefix(),
        }
    }
}

impl LoggingConfig {
    /// Override the filter directive.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Write rolling log files to `directory`.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Filter to install: `RUST_LOG` if set and valid, else the configured level.
    pub fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| LoggingError::InvalidFilter {
            filter: self.level.clone(),
            message: e.to_string(),
        })
    }
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when file logging is enabled.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = config.filter()?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_target(true);

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::Directory {
                path: dir.clone(),
                source,
            })?;

            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_timer(LocalTime::rfc_3339())
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(guard)
}
