//! In-memory tile cache using moka.
//!
//! Tile bodies live in a `moka::future::Cache` weighted by body size, so the
//! tier stays within its byte budget through automatic LRU eviction. Locks
//! live in a `DashMap` next to it.
//!
//! # Scope
//!
//! Both the tiles and the locks are private to this process. Use this tier
//! as the first tier of a multi-tier cache only when a single process serves
//! the layer; otherwise use a shared backend (memcache, redis) for tier 0 so
//! locks coordinate across workers.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::future::Cache as MokaCache;

use crate::cache::key::TileKey;
use crate::cache::lock::{self, LockAttempt, LockMedium, LockPolicy, LockToken};
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

/// Default memory budget: 256 MB.
pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// A lock held in the local lock table.
#[derive(Debug, Clone)]
struct HeldLock {
    token: LockToken,
    acquired_at: Instant,
}

/// In-memory tile cache with size-bounded LRU eviction.
pub struct MemoryCache {
    /// Tile bodies, weighted by byte length.
    tiles: MokaCache<TileKey, Bytes>,

    /// Lock table.
    locks: DashMap<TileKey, HeldLock>,

    /// Maximum size in bytes.
    max_size_bytes: u64,

    policy: LockPolicy,
}

impl MemoryCache {
    /// Create a new memory cache.
    ///
    /// # Arguments
    ///
    /// * `max_size_bytes` - Maximum total size of cached bodies
    /// * `ttl` - Optional time-to-live for entries
    pub fn new(max_size_bytes: u64, ttl: Option<Duration>) -> Self {
        let mut builder = MokaCache::builder()
            // Weight each entry by its body size
            .weigher(|_key: &TileKey, body: &Bytes| -> u32 {
                // moka uses u32 for weights, cap at u32::MAX for very large entries
                body.len().min(u32::MAX as usize) as u32
            })
            .max_capacity(max_size_bytes);

        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            tiles: builder.build(),
            locks: DashMap::new(),
            max_size_bytes,
            policy: LockPolicy::default(),
        }
    }

    /// Set the lock polling policy.
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current weighted size in bytes.
    ///
    /// Eventually consistent; call [`run_pending_tasks`](Self::run_pending_tasks)
    /// first for an exact figure.
    pub fn size_bytes(&self) -> u64 {
        self.tiles.weighted_size()
    }

    /// Current number of cached tiles.
    pub fn entry_count(&self) -> u64 {
        self.tiles.entry_count()
    }

    /// Configured maximum size in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Number of locks currently held.
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    /// Run moka's pending maintenance (eviction, expiry bookkeeping).
    pub async fn run_pending_tasks(&self) {
        self.tiles.run_pending_tasks().await;
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CACHE_BYTES, None)
    }
}

#[allow(clippy::manual_async_fn)]
impl LockMedium for MemoryCache {
    fn try_acquire(
        &self,
        key: &TileKey,
        token: &LockToken,
        _stale_timeout: Duration,
    ) -> impl std::future::Future<Output = Result<LockAttempt, CacheError>> + Send {
        let attempt = match self.locks.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(HeldLock {
                    token: token.clone(),
                    acquired_at: Instant::now(),
                });
                LockAttempt::Acquired
            }
            Entry::Occupied(held) => LockAttempt::Held {
                holder: Some(held.get().token.clone()),
                age: Some(held.get().acquired_at.elapsed()),
            },
        };
        std::future::ready(Ok(attempt))
    }

    fn break_lock(
        &self,
        key: &TileKey,
        holder: Option<&LockToken>,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send {
        self.locks
            .remove_if(key, |_, held| holder.map_or(true, |h| &held.token == h));
        std::future::ready(Ok(()))
    }
}

impl TileCache for MemoryCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn lock<'a>(
        &'a self,
        key: &'a TileKey,
        stale_timeout: Duration,
    ) -> BoxFuture<'a, Result<LockToken, CacheError>> {
        Box::pin(lock::acquire(self, key, stale_timeout, &self.policy))
    }

    fn unlock<'a>(
        &'a self,
        key: &'a TileKey,
        token: &'a LockToken,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.locks.remove_if(key, |_, held| &held.token == token);
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move { Ok(self.tiles.get(key).await) })
    }

    fn write<'a>(&'a self, key: &'a TileKey, body: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.tiles.insert(key.clone(), body).await;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.tiles.invalidate(key).await;
            self.locks.remove(key);
            Ok(())
        })
    }
}
