//! Layers and the fetch-or-render flow.
//!
//! A [`Layer`] ties a name to a cache and its lock settings. Serving a tile
//! goes through [`Layer::get_tile`]:
//!
//! ```text
//! read ──hit──────────────────────────────────────────► Cache
//!   │ miss
//!   ▼
//! lock (write_cache only)
//!   │
//! read again ──hit (someone else rendered it) ────────► CacheAfterLock
//!   │ miss
//!   ▼
//! render ─► save (releases the lock) ─────────────────► Rendered
//! ```
//!
//! Caching is an optimisation here: cache failures at any step are logged
//! and the tile is rendered and returned anyway. Only renderer failures and
//! invalid keys reach the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{BoxFuture, CacheError, LockToken, TileCache, TileKey, DEFAULT_STALE_LOCK_TIMEOUT};
use crate::coord::TileCoord;

/// Error from a tile renderer.
pub type RenderError = Box<dyn std::error::Error + Send + Sync>;

/// Produces tile bodies on a cache miss.
pub trait TileRenderer: Send + Sync {
    /// Render one tile of `layer` in `format`.
    fn render<'a>(
        &'a self,
        layer: &'a str,
        coord: TileCoord,
        format: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, RenderError>>;
}

/// Errors returned by [`Layer::get_tile`].
#[derive(Debug, Error)]
pub enum LayerError {
    /// Layer name, coordinate, or extension cannot address a tile.
    #[error("Invalid tile request: {0}")]
    InvalidKey(#[source] CacheError),

    /// The renderer failed.
    #[error("Failed to render {tile}: {source}")]
    Render {
        tile: String,
        #[source]
        source: RenderError,
    },
}

/// Where a served tile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOrigin {
    /// Found on the first read.
    Cache,
    /// Rendered by another producer while we waited for the lock.
    CacheAfterLock,
    /// Rendered by this call.
    Rendered,
}

impl fmt::Display for TileOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileOrigin::Cache => write!(f, "cache"),
            TileOrigin::CacheAfterLock => write!(f, "cache after lock"),
            TileOrigin::Rendered => write!(f, "rendered"),
        }
    }
}

/// A served tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileResponse {
    pub body: Bytes,
    pub origin: TileOrigin,
}

/// A named tile set with its cache settings.
#[derive(Clone)]
pub struct Layer {
    name: String,
    cache: Arc<dyn TileCache>,
    stale_lock_timeout: Duration,
    write_cache: bool,
}

impl Layer {
    /// Create a layer with the default lock timeout that writes to its cache.
    pub fn new(name: impl Into<String>, cache: Arc<dyn TileCache>) -> Self {
        Self {
            name: name.into(),
            cache,
            stale_lock_timeout: DEFAULT_STALE_LOCK_TIMEOUT,
            write_cache: true,
        }
    }

    /// Set the stale-lock timeout.
    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = timeout;
        self
    }

    /// Enable or disable writing rendered tiles to the cache.
    pub fn with_write_cache(mut self, write_cache: bool) -> Self {
        self.write_cache = write_cache;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> &Arc<dyn TileCache> {
        &self.cache
    }

    pub fn stale_lock_timeout(&self) -> Duration {
        self.stale_lock_timeout
    }

    pub fn write_cache(&self) -> bool {
        self.write_cache
    }

    /// Cache key for a tile of this layer.
    pub fn key(&self, coord: TileCoord, format: &str) -> Result<TileKey, CacheError> {
        TileKey::new(self.name.clone(), coord, format)
    }

    /// Serve a tile from the cache, rendering it on a miss.
    ///
    /// With `ignore_cached` the cache is never read, but the rendered tile is
    /// still written when the layer writes to its cache.
    pub async fn get_tile(
        &self,
        coord: TileCoord,
        format: &str,
        renderer: &dyn TileRenderer,
        ignore_cached: bool,
    ) -> Result<TileResponse, LayerError> {
        let key = self.key(coord, format).map_err(LayerError::InvalidKey)?;

        if !ignore_cached {
            if let Some(body) = self.try_read(&key).await {
                return Ok(TileResponse {
                    body,
                    origin: TileOrigin::Cache,
                });
            }
        }

        let token = if self.write_cache {
            match self.cache.lock(&key, self.stale_lock_timeout).await {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not lock tile, rendering without a lock");
                    None
                }
            }
        } else {
            None
        };

        if !ignore_cached {
            // Someone else may have rendered it while we waited for the lock
            if let Some(body) = self.try_read(&key).await {
                self.release(&key, token.as_ref()).await;
                return Ok(TileResponse {
                    body,
                    origin: TileOrigin::CacheAfterLock,
                });
            }
        }

        let body = match renderer.render(&self.name, coord, key.format()).await {
            Ok(body) => body,
            Err(source) => {
                self.release(&key, token.as_ref()).await;
                return Err(LayerError::Render {
                    tile: key.to_string(),
                    source,
                });
            }
        };

        if self.write_cache {
            if let Err(e) = self.cache.save(&key, body.clone(), token.as_ref()).await {
                warn!(key = %key, error = %e, "Failed to cache rendered tile");
            }
        }

        debug!(key = %key, bytes = body.len(), "Rendered tile");
        Ok(TileResponse {
            body,
            origin: TileOrigin::Rendered,
        })
    }

    async fn try_read(&self, key: &TileKey) -> Option<Bytes> {
        match self.cache.read(key).await {
            Ok(body) => body,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as a miss");
                None
            }
        }
    }

    async fn release(&self, key: &TileKey, token: Option<&LockToken>) {
        if let Some(token) = token {
            if let Err(e) = self.cache.unlock(key, token).await {
                warn!(key = %key, error = %e, "Failed to release tile lock");
            }
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("cache", &self.cache.backend())
            .field("stale_lock_timeout", &self.stale_lock_timeout)
            .field("write_cache", &self.write_cache)
            .finish()
    }
}
