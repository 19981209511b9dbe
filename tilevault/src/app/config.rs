//! Application configuration for TileVaultApp.
//!
//! The configuration file is JSON with a `"cache"` object, a `"layers"` map,
//! and an optional `"logging"` object:
//!
//! ```json
//! {
//!   "cache": {"name": "disk", "path": "cache", "dirs": "portable"},
//!   "layers": {
//!     "roads": {"stale lock timeout": 30},
//!     "labels": {"write cache": false}
//!   },
//!   "logging": {"level": "info"}
//! }
//! ```
//!
//! The `"cache"` object is handed to the
//! [`CacheRegistry`](crate::cache::CacheRegistry) as-is, so its fields depend
//! on the cache named there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::error::AppError;
use crate::cache::DEFAULT_STALE_LOCK_TIMEOUT;
use crate::logging::LoggingConfig;

/// Per-layer settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LayerConfig {
    /// Seconds after which a tile lock may be broken.
    #[serde(
        default = "default_stale_lock_timeout",
        rename = "stale lock timeout",
        alias = "stale_lock_timeout"
    )]
    pub stale_lock_timeout: u64,

    /// Whether rendered tiles are written to the cache.
    #[serde(default = "default_write_cache", rename = "write cache", alias = "write_cache")]
    pub write_cache: bool,
}

fn default_stale_lock_timeout() -> u64 {
    DEFAULT_STALE_LOCK_TIMEOUT.as_secs()
}

fn default_write_cache() -> bool {
    true
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            stale_lock_timeout: default_stale_lock_timeout(),
            write_cache: default_write_cache(),
        }
    }
}

impl LayerConfig {
    /// Stale-lock timeout as a duration.
    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_lock_timeout)
    }
}

/// Top-level configuration.
///
/// This is the configuration passed to `TileVaultApp::start()`.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Cache config object, resolved through the cache registry.
    #[serde(default = "default_cache")]
    pub cache: Value,

    /// Layers by name.
    #[serde(default)]
    pub layers: BTreeMap<String, LayerConfig>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directory relative cache paths resolve against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,

    /// Raise the log level of caches that support it.
    #[serde(skip)]
    pub verbose: bool,
}

/// Caches nothing when no `"cache"` object is given.
fn default_cache() -> Value {
    serde_json::json!({"name": "test"})
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: default_cache(),
            layers: BTreeMap::new(),
            logging: LoggingConfig::default(),
            base_dir: None,
            verbose: false,
        }
    }
}

impl AppConfig {
    /// Default config file location: `<config dir>/tilevault/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tilevault").join("config.json"))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        serde_json::from_str(json).map_err(|source| AppError::ConfigParse { path: None, source })
    }

    /// Load configuration from a file.
    ///
    /// Relative cache paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self =
            serde_json::from_str(&contents).map_err(|source| AppError::ConfigParse {
                path: Some(path.to_path_buf()),
                source,
            })?;

        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Ok(config)
    }

    /// Set the cache config object.
    pub fn with_cache(mut self, cache: Value) -> Self {
        self.cache = cache;
        self
    }

    /// Add or replace a layer.
    pub fn with_layer(mut self, name: impl Into<String>, layer: LayerConfig) -> Self {
        self.layers.insert(name.into(), layer);
        self
    }

    /// Set the directory relative paths resolve against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Enable verbose cache logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_layer_config_defaults() {
        let config = LayerConfig::default();
        assert_eq!(config.stale_lock_timeout, 15);
        assert_eq!(config.stale_lock_timeout(), Duration::from_secs(15));
        assert!(config.write_cache);
    }

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_json_str(
            r#"{
                "cache": {"name": "Disk", "path": "/tmp/stache"},
                "layers": {
                    "roads": {"stale lock timeout": 30},
                    "labels": {"write_cache": false}
                },
                "logging": {"level": "debug"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache["name"], "Disk");
        assert_eq!(config.layers["roads"].stale_lock_timeout, 30);
        assert!(config.layers["roads"].write_cache);
        assert!(!config.layers["labels"].write_cache);
        assert_eq!(config.logging.level, "debug");
        assert!(config.base_dir.is_none());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_json_str("{}").unwrap();
        assert_eq!(config.cache["name"], "test");
        assert!(config.layers.is_empty());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_json() {
        let result = AppConfig::from_json_str("{\"layers\": ");
        assert!(matches!(result, Err(AppError::ConfigParse { path: None, .. })));

        let result = AppConfig::from_json_str(r#"{"layers": {"roads": {"write cache": "yes"}}}"#);
        assert!(matches!(result, Err(AppError::ConfigParse { .. })));
    }

    #[test]
    fn test_load_sets_base_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tilevault.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"cache": {{"name": "disk", "path": "cache"}}}}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.base_dir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load(Path::new("/nonexistent/tilevault.json"));
        assert!(matches!(result, Err(AppError::ConfigRead { .. })));
    }

    #[test]
    fn test_default_path_ends_with_config_json() {
        if let Some(path) = AppConfig::default_path() {
            assert!(path.ends_with("tilevault/config.json"));
        }
    }
}
