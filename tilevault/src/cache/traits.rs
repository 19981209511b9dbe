//! Core traits for the tile cache.
//!
//! The `TileCache` trait is the capability set every cache backend exposes:
//! lock, unlock, read, save, and remove. Backends range from an in-process
//! memory cache to shared network stores, and the multi-tier cache composes
//! them through the same interface.
//!
//! # Design Principles
//!
//! - **Opaque bodies**: Tile bodies are `Bytes`; the cache never inspects them
//! - **Misses are not errors**: `read` returns `Ok(None)` on a miss
//! - **Advisory locks**: Locks live in the backend medium itself so they
//!   work across processes and hosts, but only cooperating callers honor them
//! - **Fenced unlocks**: `lock` hands out a [`LockToken`]; unlocking with a
//!   token that no longer owns the lock is a no-op
//! - **Dyn-compatible**: Uses `Pin<Box<dyn Future>>` for trait object support
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tilevault::cache::{TileCache, TileKey};
//!
//! let key = TileKey::new("roads", coord, "png")?;
//! if cache.read(&key).await?.is_none() {
//!     let token = cache.lock(&key, Duration::from_secs(15)).await?;
//!     let body = render(&key).await;
//!     cache.save(&key, body, Some(&token)).await?;
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::cache::key::TileKey;
use crate::cache::lock::LockToken;
use crate::coord::CoordError;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A lock could not be acquired within the bound derived from the
    /// stale-lock timeout.
    #[error("Timed out acquiring lock for {key} after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    /// The backend medium could not be reached or returned a failure.
    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable {
        backend: &'static str,
        message: String,
    },

    /// Malformed backend parameters, raised while building a cache.
    #[error("Cache configuration error: {0}")]
    Configuration(String),

    /// The layer, coordinate, or format cannot form a cache key.
    #[error("Invalid tile key: {0}")]
    InvalidKey(String),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Build a `BackendUnavailable` error from any displayable failure.
    pub fn backend(backend: &'static str, err: impl fmt::Display) -> Self {
        CacheError::BackendUnavailable {
            backend,
            message: err.to_string(),
        }
    }

    /// Build a `Configuration` error.
    pub fn config(message: impl Into<String>) -> Self {
        CacheError::Configuration(message.into())
    }

    /// Whether this error came from the storage medium rather than the caller.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            CacheError::BackendUnavailable { .. } | CacheError::Io(_)
        )
    }
}

impl From<CoordError> for CacheError {
    fn from(e: CoordError) -> Self {
        CacheError::InvalidKey(e.to_string())
    }
}

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tile cache capability set.
///
/// # Locking
///
/// `lock` blocks (by polling the backend) until the key is free or the
/// existing lock is older than `stale_timeout`, in which case the stale lock
/// is broken and taken over. A caller that cannot get the lock within the
/// backend's bound receives [`CacheError::LockTimeout`].
///
/// `read`, `write`, and `remove` never wait on locks held by other callers.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` for use across async tasks.
pub trait TileCache: Send + Sync {
    /// Short backend label used in logs and errors (e.g. `"disk"`).
    fn backend(&self) -> &'static str;

    /// Acquire the advisory lock for a tile, returning the owner token.
    fn lock<'a>(
        &'a self,
        key: &'a TileKey,
        stale_timeout: Duration,
    ) -> BoxFuture<'a, Result<LockToken, CacheError>>;

    /// Release a lock previously acquired with `token`.
    ///
    /// Idempotent: releasing a lock that was already released, expired, or
    /// broken and re-taken by another caller succeeds without side effects.
    fn unlock<'a>(
        &'a self,
        key: &'a TileKey,
        token: &'a LockToken,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Read a cached tile body.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(body))` on a hit
    /// - `Ok(None)` if the tile is not cached (or has outlived its lifespan)
    /// - `Err(_)` if the backend could not answer
    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>>;

    /// Store a tile body, replacing any existing one.
    fn write<'a>(&'a self, key: &'a TileKey, body: Bytes) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Delete a stored tile. Removing a missing tile succeeds.
    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Store a tile body and release the caller's lock on it.
    ///
    /// The lock is released even when the write fails; the write error takes
    /// precedence in that case.
    fn save<'a>(
        &'a self,
        key: &'a TileKey,
        body: Bytes,
        lock: Option<&'a LockToken>,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let written = self.write(key, body).await;

            if let Some(token) = lock {
                if let Err(e) = self.unlock(key, token).await {
                    if written.is_ok() {
                        return Err(e);
                    }
                    warn!(error = %e, key = %key, "Unlock after failed save also failed");
                }
            }

            written
        })
    }
}
