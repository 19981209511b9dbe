//! Application error types.

use std::fmt;
use std::path::PathBuf;

use crate::cache::CacheError;
use crate::logging::LoggingError;

/// Errors that can occur while loading configuration and starting up.
#[derive(Debug)]
pub enum AppError {
    /// Failed to read the configuration file.
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration is not valid JSON or has the wrong shape.
    ConfigParse {
        path: Option<PathBuf>,
        source: serde_json::Error,
    },

    /// Configuration error.
    Config(String),

    /// Failed to build the cache.
    CacheStart(CacheError),

    /// Failed to install logging.
    Logging(LoggingError),

    /// No layer with this name is configured.
    UnknownLayer(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ConfigRead { path, source } => {
                write!(f, "Failed to read config file {}: {}", path.display(), source)
            }
            AppError::ConfigParse {
                path: Some(path),
                source,
            } => {
                write!(f, "Failed to parse config file {}: {}", path.display(), source)
            }
            AppError::ConfigParse { path: None, source } => {
                write!(f, "Failed to parse config: {}", source)
            }
            AppError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            AppError::CacheStart(e) => {
                write!(f, "Failed to start cache: {}", e)
            }
            AppError::Logging(e) => {
                write!(f, "Failed to initialize logging: {}", e)
            }
            AppError::UnknownLayer(name) => {
                write!(f, "Unknown layer: {}", name)
            }
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::ConfigRead { source, .. } => Some(source),
            AppError::ConfigParse { source, .. } => Some(source),
            AppError::Config(_) => None,
            AppError::CacheStart(e) => Some(e),
            AppError::Logging(e) => Some(e),
            AppError::UnknownLayer(_) => None,
        }
    }
}

impl From<CacheError> for AppError {
    fn from(e: CacheError) -> Self {
        AppError::CacheStart(e)
    }
}

impl From<LoggingError> for AppError {
    fn from(e: LoggingError) -> Self {
        AppError::Logging(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config("missing cache".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing cache");

        let err = AppError::UnknownLayer("roads".to_string());
        assert_eq!(err.to_string(), "Unknown layer: roads");
    }

    #[test]
    fn test_app_error_from_cache_error() {
        let err: AppError = CacheError::config("bad dirs").into();
        assert!(matches!(err, AppError::CacheStart(_)));
        assert!(err.to_string().contains("bad dirs"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_config_read_source() {
        let err = AppError::ConfigRead {
            path: PathBuf::from("/etc/tilevault.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("/etc/tilevault.json"));
        assert!(err.source().is_some());
    }
}
