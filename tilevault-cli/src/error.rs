//! CLI error types.

use std::fmt;
use std::path::PathBuf;

use tilevault::app::AppError;
use tilevault::cache::CacheError;
use tilevault::coord::ParseError;
use tilevault::logging::LoggingError;

/// Errors reported by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// No config file given and no default location exists.
    Config(String),

    /// Config, startup, or layer lookup failed.
    App(AppError),

    /// Failed to set up logging.
    Logging(LoggingError),

    /// Failed to create the async runtime.
    Runtime(std::io::Error),

    /// The tile argument is not a valid `z/x/y.ext` path.
    InvalidTile { tile: String, source: ParseError },

    /// The tile argument has no extension.
    MissingExtension(String),

    /// A cache operation failed.
    Cache(CacheError),

    /// Reading or writing a local file failed.
    File { path: PathBuf, source: std::io::Error },

    /// The requested tile is not cached.
    NotCached(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::App(e) => write!(f, "{}", e),
            CliError::Logging(e) => write!(f, "{}", e),
            CliError::Runtime(e) => write!(f, "Failed to create async runtime: {}", e),
            CliError::InvalidTile { tile, source } => {
                write!(f, "Invalid tile {:?}: {}", tile, source)
            }
            CliError::MissingExtension(tile) => {
                write!(f, "Tile {:?} needs an extension, e.g. {}.png", tile, tile)
            }
            CliError::Cache(e) => write!(f, "Cache error: {}", e),
            CliError::File { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
            CliError::NotCached(tile) => write!(f, "Tile not cached: {}", tile),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::App(e) => Some(e),
            CliError::Logging(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::InvalidTile { source, .. } => Some(source),
            CliError::Cache(e) => Some(e),
            CliError::File { source, .. } => Some(source),
            CliError::Config(_) | CliError::MissingExtension(_) | CliError::NotCached(_) => None,
        }
    }
}

impl From<AppError> for CliError {
    fn from(e: AppError) -> Self {
        CliError::App(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<CacheError> for CliError {
    fn from(e: CacheError) -> Self {
        CliError::Cache(e)
    }
}
