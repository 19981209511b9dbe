//! Application bootstrap.
//!
//! `TileVaultApp` builds the configured cache once and hands it to every
//! configured layer, so all layers share one set of connections and one lock
//! namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::config::AppConfig;
use super::error::AppError;
use crate::cache::{BuildContext, CacheRegistry, TileCache, TileKey};
use crate::coord::TileCoord;
use crate::layer::Layer;

/// A started tile cache with its layers.
pub struct TileVaultApp {
    /// Shared cache behind every layer.
    cache: Arc<dyn TileCache>,

    /// Layers by name.
    layers: BTreeMap<String, Layer>,

    /// Configuration the app was started with.
    config: AppConfig,
}

impl TileVaultApp {
    /// Start the application with the built-in cache backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache config names an unknown backend, a
    /// backend cannot connect, or a layer name is not usable as a cache key.
    pub async fn start(config: AppConfig) -> Result<Self, AppError> {
        Self::start_with_registry(config, &CacheRegistry::with_builtins()).await
    }

    /// Start the application, resolving the cache through `registry`.
    pub async fn start_with_registry(
        config: AppConfig,
        registry: &CacheRegistry,
    ) -> Result<Self, AppError> {
        info!(layers = config.layers.len(), "Starting TileVault");

        let ctx = BuildContext {
            base_dir: config.base_dir.clone(),
            verbose: config.verbose,
        };
        let cache = registry.build(&config.cache, &ctx).await?;
        info!(backend = cache.backend(), "Cache ready");

        let mut layers = BTreeMap::new();
        for (name, settings) in &config.layers {
            validate_layer_name(name)?;

            let layer = Layer::new(name.clone(), Arc::clone(&cache))
                .with_stale_lock_timeout(settings.stale_lock_timeout())
                .with_write_cache(settings.write_cache);

            debug!(
                layer = %name,
                stale_lock_timeout_secs = settings.stale_lock_timeout,
                write_cache = settings.write_cache,
                "Layer configured"
            );
            layers.insert(name.clone(), layer);
        }

        Ok(Self {
            cache,
            layers,
            config,
        })
    }

    /// Start the application on a runtime owned by the caller's thread.
    ///
    /// For synchronous callers that do not run inside a tokio runtime.
    pub fn start_sync(config: AppConfig, runtime: &tokio::runtime::Runtime) -> Result<Self, AppError> {
        runtime.block_on(Self::start(config))
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<dyn TileCache> {
        &self.cache
    }

    /// Look up a layer by name.
    pub fn layer(&self, name: &str) -> Result<&Layer, AppError> {
        self.layers
            .get(name)
            .ok_or_else(|| AppError::UnknownLayer(name.to_string()))
    }

    /// All layers, ordered by name.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// The configuration the app was started with.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl std::fmt::Debug for TileVaultApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileVaultApp")
            .field("backend", &self.cache.backend())
            .field("layers", &self.layers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Reject layer names that cannot appear in a cache key.
fn validate_layer_name(name: &str) -> Result<(), AppError> {
    let origin = TileCoord {
        zoom: 0,
        column: 0,
        row: 0,
    };
    TileKey::new(name, origin, "png")
        .map(|_| ())
        .map_err(|e| AppError::Config(format!("Layer {:?}: {}", name, e)))
}
