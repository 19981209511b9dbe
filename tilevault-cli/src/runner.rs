//! Shared setup for CLI commands.
//!
//! `CliRunner` loads the config file, installs logging, and starts the tile
//! cache on a runtime it owns, so commands stay synchronous.

use std::future::Future;
use std::path::PathBuf;

use tracing::info;

use tilevault::app::{AppConfig, TileVaultApp};
use tilevault::logging::{init_logging, WorkerGuard};

use crate::error::CliError;

/// A started cache plus the runtime that drives it.
pub struct CliRunner {
    runtime: tokio::runtime::Runtime,
    app: TileVaultApp,
    _log_guard: Option<WorkerGuard>,
}

impl CliRunner {
    /// Load config from `config_path` (or the default location), install
    /// logging, and start the cache.
    pub fn new(config_path: Option<PathBuf>, verbose: bool) -> Result<Self, CliError> {
        let path = match config_path {
            Some(path) => path,
            None => {
                let path = AppConfig::default_path().ok_or_else(|| {
                    CliError::Config("No config directory on this system, use --config".to_string())
                })?;
                if !path.exists() {
                    return Err(CliError::Config(format!(
                        "No config file at {}, use --config",
                        path.display()
                    )));
                }
                path
            }
        };

        let mut config = AppConfig::load(&path)?.with_verbose(verbose);
        if verbose {
            config.logging.level = "debug".to_string();
        }

        let guard = init_logging(&config.logging)?;
        info!(
            version = tilevault::VERSION,
            config = %path.display(),
            "tilevault starting"
        );

        let mut runner = Self::with_config(config)?;
        runner._log_guard = guard;
        Ok(runner)
    }

    /// Start the cache from an already loaded config, without touching
    /// logging.
    pub fn with_config(config: AppConfig) -> Result<Self, CliError> {
        let runtime = tokio::runtime::Runtime::new().map_err(CliError::Runtime)?;
        let app = TileVaultApp::start_sync(config, &runtime)?;

        Ok(Self {
            runtime,
            app,
            _log_guard: None,
        })
    }

    /// The started application.
    pub fn app(&self) -> &TileVaultApp {
        &self.app
    }

    /// Run a future to completion on the runner's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
