//! TileVault - a tile cache with locking and multi-tier fallback
//!
//! This library stores rendered map tiles, addressed by layer, zoom, column,
//! row and format, in pluggable backends: in memory, on local disk, in
//! memcached or redis, or in an S3 bucket. Backends can be stacked into
//! tiers, and every backend provides an advisory per-tile lock so that
//! concurrent requests for the same missing tile render it only once.
//!
//! - [`coord`] tile coordinates and `z/x/y.ext` path parsing
//! - [`cache`] the cache contract, its backends and the tier composer
//! - [`layer`] the lock-then-render-then-save request flow
//! - [`app`] configuration loading and startup
//! - [`logging`] tracing subscriber setup

pub mod app;
pub mod cache;
pub mod coord;
pub mod layer;
pub mod logging;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
