//! Single-tier cache backends.
//!
//! Each backend implements [`TileCache`](crate::cache::TileCache) and keeps
//! its locks in the same medium as its tiles.
//!
//! # Available Backends
//!
//! - [`TestCache`]: Stores nothing, logs every call
//! - [`MemoryCache`]: In-process LRU cache using moka
//! - [`DiskCache`]: Filesystem cache with configurable directory layout
//! - [`MemcacheCache`]: Memcache servers (feature `memcache`)
//! - [`RedisCache`]: Redis server (feature `redis`)
//! - [`S3Cache`]: S3 or S3-compatible bucket (feature `s3`)
//!
//! Backends are normally built from configuration through the
//! [`CacheRegistry`](crate::cache::CacheRegistry).

mod disk;
mod memory;
mod test_cache;

#[cfg(feature = "memcache")]
mod memcached;
#[cfg(feature = "redis")]
mod redis_cache;
#[cfg(feature = "s3")]
mod s3_cache;

pub use disk::{DiskCache, DiskCacheConfig, DEFAULT_GZIP_FORMATS, DEFAULT_UMASK};
pub use memory::{MemoryCache, DEFAULT_MEMORY_CACHE_BYTES};
pub use test_cache::TestCache;

#[cfg(feature = "memcache")]
pub use memcached::{MemcacheCache, MemcacheConfig, DEFAULT_MEMCACHE_SERVER};
#[cfg(feature = "redis")]
pub use redis_cache::{RedisCache, RedisConfig};
#[cfg(feature = "s3")]
pub use s3_cache::{content_type, S3Cache, S3Config};
