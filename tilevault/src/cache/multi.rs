//! Multi-tier cache.
//!
//! Composes an ordered list of caches into one logical cache. Tier 0 is the
//! fast, authoritative tier; later tiers are slower and larger.
//!
//! | Operation | Tiers involved                                  |
//! |-----------|-------------------------------------------------|
//! | `read`    | In order until the first hit                    |
//! | `write`   | All tiers                                       |
//! | `remove`  | All tiers                                       |
//! | `lock`    | Tier 0 only                                     |
//! | `unlock`  | Tier 0 only                                     |
//!
//! Failures in tier 0 are returned to the caller. Failures in any later tier
//! are logged and suppressed: a lagging slow tier only costs a future miss.
//!
//! With `promote_on_read` (the default) a hit in tier `i > 0` is copied into
//! tiers `0..i` so the next read is served by the fastest tier.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::key::TileKey;
use crate::cache::lock::LockToken;
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

/// Snapshot of multi-tier counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Hits served by each tier, indexed by tier position.
    pub hits: Vec<u64>,
    /// Reads that missed every tier.
    pub misses: u64,
    /// Tiles copied into faster tiers after a hit.
    pub promotions: u64,
    /// Errors from tiers after the first that were logged and suppressed.
    pub suppressed_errors: u64,
}

impl TierStats {
    /// Total number of hits across tiers.
    pub fn total_hits(&self) -> u64 {
        self.hits.iter().sum()
    }

    /// Fraction of reads that hit some tier, 0.0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.total_hits();
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct Counters {
    hits: Vec<AtomicU64>,
    misses: AtomicU64,
    promotions: AtomicU64,
    suppressed_errors: AtomicU64,
}

impl Counters {
    fn new(tiers: usize) -> Self {
        Self {
            hits: (0..tiers).map(|_| AtomicU64::new(0)).collect(),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            suppressed_errors: AtomicU64::new(0),
        }
    }
}

/// Ordered composition of caches.
pub struct MultiTierCache {
    tiers: Vec<Arc<dyn TileCache>>,
    promote_on_read: bool,
    counters: Counters,
}

impl MultiTierCache {
    /// Compose `tiers`, fastest first.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Configuration`] if `tiers` is empty.
    pub fn new(tiers: Vec<Arc<dyn TileCache>>) -> Result<Self, CacheError> {
        if tiers.is_empty() {
            return Err(CacheError::config("multi cache needs at least one tier"));
        }

        let counters = Counters::new(tiers.len());
        Ok(Self {
            tiers,
            promote_on_read: true,
            counters,
        })
    }

    /// Enable or disable copying lower-tier hits into faster tiers.
    pub fn with_promote_on_read(mut self, promote: bool) -> Self {
        self.promote_on_read = promote;
        self
    }

    /// Whether lower-tier hits are promoted.
    pub fn promote_on_read(&self) -> bool {
        self.promote_on_read
    }

    /// Number of tiers.
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Tiers in read order.
    pub fn tiers(&self) -> &[Arc<dyn TileCache>] {
        &self.tiers
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> TierStats {
        TierStats {
            hits: self
                .counters
                .hits
                .iter()
                .map(|h| h.load(Ordering::Relaxed))
                .collect(),
            misses: self.counters.misses.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            suppressed_errors: self.counters.suppressed_errors.load(Ordering::Relaxed),
        }
    }

    fn primary(&self) -> &dyn TileCache {
        // Non-empty by construction
        self.tiers[0].as_ref()
    }

    fn suppress(&self, tier: usize, op: &'static str, key: &TileKey, error: &CacheError) {
        self.counters.suppressed_errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            tier = tier,
            backend = self.tiers[tier].backend(),
            op = op,
            key = %key,
            error = %error,
            "Secondary cache tier failed, continuing"
        );
    }

    /// Collect per-tier results: tier 0's error is returned, the rest logged.
    fn settle(
        &self,
        op: &'static str,
        key: &TileKey,
        results: Vec<Result<(), CacheError>>,
    ) -> Result<(), CacheError> {
        let mut primary = Ok(());
        for (tier, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => {}
                Err(e) if tier == 0 => primary = Err(e),
                Err(e) => self.suppress(tier, op, key, &e),
            }
        }
        primary
    }

    async fn promote(&self, key: &TileKey, body: &Bytes, found_in: usize) {
        let writes = self.tiers[..found_in]
            .iter()
            .map(|tier| tier.write(key, body.clone()));

        for (tier, result) in join_all(writes).await.into_iter().enumerate() {
            match result {
                Ok(()) => {
                    self.counters.promotions.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Never fails the read, whichever tier refused the copy
                    self.counters.suppressed_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(tier = tier, key = %key, error = %e, "Failed to promote tile");
                }
            }
        }
    }
}

impl fmt::Debug for MultiTierCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backends: Vec<&str> = self.tiers.iter().map(|t| t.backend()).collect();
        f.debug_struct("MultiTierCache")
            .field("tiers", &backends)
            .field("promote_on_read", &self.promote_on_read)
            .finish()
    }
}

impl TileCache for MultiTierCache {
    fn backend(&self) -> &'static str {
        "multi"
    }

    fn lock<'a>(
        &'a self,
        key: &'a TileKey,
        stale_timeout: Duration,
    ) -> BoxFuture<'a, Result<LockToken, CacheError>> {
        self.primary().lock(key, stale_timeout)
    }

    fn unlock<'a>(
        &'a self,
        key: &'a TileKey,
        token: &'a LockToken,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        self.primary().unlock(key, token)
    }

    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move {
            for (index, tier) in self.tiers.iter().enumerate() {
                let body = match tier.read(key).await {
                    Ok(Some(body)) => body,
                    Ok(None) => continue,
                    Err(e) if index == 0 => return Err(e),
                    Err(e) => {
                        self.suppress(index, "read", key, &e);
                        continue;
                    }
                };

                self.counters.hits[index].fetch_add(1, Ordering::Relaxed);
                debug!(tier = index, key = %key, "Cache hit");

                if index > 0 && self.promote_on_read {
                    self.promote(key, &body, index).await;
                }

                return Ok(Some(body));
            }

            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        })
    }

    fn write<'a>(&'a self, key: &'a TileKey, body: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let writes = self.tiers.iter().map(|tier| tier.write(key, body.clone()));
            let results = join_all(writes).await;
            self.settle("write", key, results)
        })
    }

    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let removals = self.tiers.iter().map(|tier| tier.remove(key));
            let results = join_all(removals).await;
            self.settle("remove", key, results)
        })
    }
}
