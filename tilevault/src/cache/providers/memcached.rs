//! Memcache tile cache.
//!
//! Keys are `{key prefix}/{revision}/{layer}/{z}/{x}/{y}.{ext}`; bumping the
//! revision invalidates every cached tile at once without flushing the
//! servers. A lock is a `{key}-lock` entry created with `add` and an expiry
//! equal to the stale-lock timeout, so memcache drops abandoned locks itself.
//!
//! The `memcache` client is synchronous; every call runs on tokio's blocking
//! pool.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use memcache::MemcacheError;
use serde::Deserialize;
use tracing::debug;

use crate::cache::key::TileKey;
use crate::cache::lock::{self, LockAttempt, LockMedium, LockPolicy, LockToken};
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

/// Server used when none are configured.
pub const DEFAULT_MEMCACHE_SERVER: &str = "127.0.0.1:11211";

const BACKEND: &str = "memcache";

/// Memcache settings as they appear in the `"cache"` config object.
#[derive(Debug, Clone, Deserialize)]
pub struct MemcacheConfig {
    /// `host:port` (or `memcache://` URLs) of the servers.
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    /// Cache revision, part of every key.
    #[serde(default)]
    pub revision: u32,

    /// Prefix for every key.
    #[serde(default, rename = "key prefix", alias = "key_prefix")]
    pub key_prefix: String,

    /// Seconds before memcache expires a cached tile. `None` keeps tiles
    /// until evicted.
    #[serde(default)]
    pub lifespan: Option<u32>,
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            revision: 0,
            key_prefix: String::new(),
            lifespan: None,
        }
    }
}

fn default_servers() -> Vec<String> {
    vec![DEFAULT_MEMCACHE_SERVER.to_string()]
}

/// Normalise a server entry into a `memcache://` URL.
fn server_url(server: &str) -> String {
    if server.contains("://") {
        server.to_string()
    } else {
        format!("memcache://{}", server)
    }
}

/// Seconds for a memcache expiry; memcache has one-second resolution and
/// treats zero as "never".
fn expiry_secs(duration: Duration) -> u32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.clamp(1, u64::from(u32::MAX)) as u32
}

/// Memcache-backed tile cache.
pub struct MemcacheCache {
    client: Arc<memcache::Client>,
    prefix: String,
    lifespan: u32,
    policy: LockPolicy,
}

impl MemcacheCache {
    /// Connect to the configured servers.
    pub fn connect(config: MemcacheConfig) -> Result<Self, CacheError> {
        if config.servers.is_empty() {
            return Err(CacheError::config("memcache cache needs at least one server"));
        }

        let urls: Vec<String> = config.servers.iter().map(|s| server_url(s)).collect();
        let client = memcache::Client::connect(urls).map_err(|e| CacheError::backend(BACKEND, e))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: key_namespace(&config.key_prefix, config.revision),
            lifespan: config.lifespan.unwrap_or(0),
            policy: LockPolicy::default(),
        })
    }

    /// Set the lock polling policy.
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Memcache key for a tile.
    pub fn tile_key(&self, key: &TileKey) -> String {
        key.object_key(&self.prefix)
    }

    /// Memcache key for a tile's lock.
    pub fn lock_key(&self, key: &TileKey) -> String {
        format!("{}-lock", self.tile_key(key))
    }

    /// Run a client call on the blocking pool.
    async fn call<T, F>(&self, work: F) -> Result<T, CacheError>
    where
        F: FnOnce(&memcache::Client) -> Result<T, MemcacheError> + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || work(&client))
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))?
            .map_err(|e| CacheError::backend(BACKEND, e))
    }

    async fn delete_if_held(&self, lock_key: String, holder: Option<LockToken>) -> Result<bool, CacheError> {
        self.call(move |client| {
            if let Some(holder) = holder {
                let stored: Option<String> = client.get(&lock_key)?;
                if stored.as_deref().map(str::trim) != Some(holder.as_str()) {
                    return Ok(false);
                }
            }
            client.delete(&lock_key)
        })
        .await
    }
}

/// `{prefix}/{revision}`, without a leading slash when the prefix is empty.
fn key_namespace(prefix: &str, revision: u32) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        revision.to_string()
    } else {
        format!("{}/{}", prefix, revision)
    }
}

#[allow(clippy::manual_async_fn)]
impl LockMedium for MemcacheCache {
    fn try_acquire(
        &self,
        key: &TileKey,
        token: &LockToken,
        stale_timeout: Duration,
    ) -> impl std::future::Future<Output = Result<LockAttempt, CacheError>> + Send {
        let lock_key = self.lock_key(key);
        let token = token.clone();
        let ttl = expiry_secs(stale_timeout);
        async move {
            self.call(move |client| match client.add(&lock_key, token.as_str(), ttl) {
                Ok(()) => Ok(LockAttempt::Acquired),
                // Key exists (binary protocol) or NOT_STORED (ascii)
                Err(MemcacheError::CommandError(_)) => {
                    let holder: Option<String> = client.get(&lock_key)?;
                    Ok(LockAttempt::Held {
                        holder: holder.as_deref().map(LockToken::from_stored),
                        age: None,
                    })
                }
                Err(e) => Err(e),
            })
            .await
        }
    }

    fn break_lock(
        &self,
        key: &TileKey,
        holder: Option<&LockToken>,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send {
        let lock_key = self.lock_key(key);
        let holder = holder.cloned();
        async move {
            self.delete_if_held(lock_key, holder).await?;
            Ok(())
        }
    }
}

impl TileCache for MemcacheCache {
    fn backend(&self) -> &'static str {
        BACKEND
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
            let released = self
                .delete_if_held(self.lock_key(key), Some(token.clone()))
                .await?;
            if !released {
                debug!(key = %key, token = %token, "Lock no longer held by this token");
            }
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        let mkey = self.tile_key(key);
        Box::pin(async move {
            let body: Option<Vec<u8>> = self.call(move |client| client.get(&mkey)).await?;
            Ok(body.map(Bytes::from))
        })
    }

    fn write<'a>(&'a self, key: &'a TileKey, body: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        let mkey = self.tile_key(key);
        let lifespan = self.lifespan;
        Box::pin(async move {
            self.call(move |client| client.set(&mkey, body.as_ref(), lifespan))
                .await
        })
    }

    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>> {
        let mkey = self.tile_key(key);
        let lock_key = self.lock_key(key);
        Box::pin(async move {
            self.call(move |client| {
                client.delete(&mkey)?;
                client.delete(&lock_key)?;
                Ok(())
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::TileCoord;

    fn key() -> TileKey {
        TileKey::new("roads", TileCoord::new(12, 656, 1582).unwrap(), "png").unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config: MemcacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.servers, vec!["127.0.0.1:11211"]);
        assert_eq!(config.revision, 0);
        assert!(config.key_prefix.is_empty());
        assert!(config.lifespan.is_none());
    }

    #[test]
    fn test_config_spaced_and_snake_keys() {
        let spaced: MemcacheConfig =
            serde_json::from_str(r#"{"key prefix": "tiles", "revision": 4}"#).unwrap();
        let snake: MemcacheConfig =
            serde_json::from_str(r#"{"key_prefix": "tiles", "revision": 4}"#).unwrap();
        assert_eq!(spaced.key_prefix, "tiles");
        assert_eq!(snake.key_prefix, "tiles");
    }

    #[test]
    fn test_key_namespace() {
        assert_eq!(key_namespace("", 0), "0");
        assert_eq!(key_namespace("tiles", 4), "tiles/4");
        assert_eq!(key().object_key(&key_namespace("tiles", 4)), "tiles/4/roads/12/656/1582.png");
    }

    #[test]
    fn test_server_url() {
        assert_eq!(server_url("127.0.0.1:11211"), "memcache://127.0.0.1:11211");
        assert_eq!(server_url("memcache://cache:11211"), "memcache://cache:11211");
    }

    #[test]
    fn test_expiry_secs() {
        assert_eq!(expiry_secs(Duration::from_secs(15)), 15);
        assert_eq!(expiry_secs(Duration::from_millis(1500)), 2);
        assert_eq!(expiry_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_connect_requires_servers() {
        let config = MemcacheConfig {
            servers: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            MemcacheCache::connect(config),
            Err(CacheError::Configuration(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires memcached on 127.0.0.1:11211
    async fn test_memcache_live() {
        let cache = MemcacheCache::connect(MemcacheConfig {
            key_prefix: "tilevault-test".to_string(),
            ..Default::default()
        })
        .unwrap();
        let key = key();

        cache.remove(&key).await.unwrap();
        assert!(cache.read(&key).await.unwrap().is_none());

        let token = cache.lock(&key, Duration::from_secs(5)).await.unwrap();
        cache
            .save(&key, Bytes::from_static(b"tile"), Some(&token))
            .await
            .unwrap();
        assert_eq!(
            cache.read(&key).await.unwrap(),
            Some(Bytes::from_static(b"tile"))
        );

        cache.remove(&key).await.unwrap();
    }
}
