//! Cache that stores nothing.
//!
//! Every read misses, writes are dropped, and locks are granted immediately.
//! Each call is logged (at debug, or info when verbose), which makes it handy
//! for checking what a layer asks of its cache without standing up a backend.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::cache::key::TileKey;
use crate::cache::lock::LockToken;
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

/// No-op cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestCache {
    verbose: bool,
}

impl TestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log operations at info instead of debug.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn note(&self, op: &'static str, key: &TileKey) {
        if self.verbose {
            info!(key = %key, "Test cache: {}", op);
        } else {
            debug!(key = %key, "Test cache: {}", op);
        }
    }
}

impl TileCache for TestCache {
    fn backend(&self) -> &'static str {
        "test"
    }

    fn lock<'a>(
        &'a self,
        key: &'a TileKey,
        _stale_timeout: Duration,
    ) -> BoxFuture<'a, Result<LockToken, CacheError>> {
        Box::pin(async move {
            self.note("lock", key);
            Ok(LockToken::generate())
        })
    }

    fn unlock<'a>(
        &'a self,
        key: &'a TileKey,
        _token: &'a LockToken,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.note("unlock", key);
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move {
            self.note("read", key);
            Ok(None)
        })
    }

    fn write<'a>(&'a self, key: &'a TileKey, _body: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.note("save", key);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.note("remove", key);
            Ok(())
        })
    }
}
