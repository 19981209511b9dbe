//! Tile cache subsystem.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MultiTierCache                        │
//! │   read: tier by tier    write/remove: all    lock: tier 0    │
//! └──────────────┬──────────────────────┬────────────────────────┘
//!                │                      │
//!        ┌───────▼───────┐      ┌───────▼───────┐
//!        │  TileCache    │      │  TileCache    │   ...
//!        │ (memory, ...) │      │ (disk, s3...) │
//!        └───────────────┘      └───────────────┘
//! ```
//!
//! - [`TileKey`] names a cached tile and derives backend addresses
//! - [`TileCache`] is the capability set every backend implements
//! - [`lock`] holds the shared polling / stale-breaking loop
//! - [`providers`] contains the single-tier backends
//! - [`MultiTierCache`] composes backends into tiers
//! - [`CacheRegistry`] builds caches from their config objects

pub mod key;
pub mod lock;
pub mod multi;
pub mod providers;
pub mod registry;
mod traits;

pub use key::{DirLayout, TileKey};
pub use lock::{LockPolicy, LockToken, DEFAULT_STALE_LOCK_TIMEOUT};
pub use multi::{MultiTierCache, TierStats};
pub use providers::{DiskCache, MemoryCache, TestCache};
pub use registry::{BuildContext, CacheFactory, CacheRegistry};
pub use traits::{BoxFuture, CacheError, TileCache};
