//! Redis tile cache.
//!
//! Tiles are stored at `{key prefix}/{layer}/{z}/{x}/{y}.{ext}` and locks at
//! the same key with a `-lock` suffix. Locks are taken with
//! `SET key token NX PX stale_timeout`, so Redis expires abandoned locks on
//! its own, and released with a compare-and-delete script so only the token
//! owner can release them.

use std::time::Duration;

use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Deserialize;
use tracing::{debug, info};

use crate::cache::key::TileKey;
use crate::cache::lock::{self, LockAttempt, LockMedium, LockPolicy, LockToken};
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

const BACKEND: &str = "redis";

/// Deletes KEYS[1] only if it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis settings as they appear in the `"cache"` config object.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    /// Prefix for every key.
    #[serde(default, rename = "key prefix", alias = "key_prefix")]
    pub key_prefix: String,

    /// Seconds before Redis expires a cached tile.
    #[serde(default)]
    pub lifespan: Option<u64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            key_prefix: String::new(),
            lifespan: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

impl RedisConfig {
    /// Connection URL for the configured server and database.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

fn redis_err(e: redis::RedisError) -> CacheError {
    CacheError::backend(BACKEND, e)
}

/// Redis-backed tile cache.
pub struct RedisCache {
    conn: ConnectionManager,
    key_prefix: String,
    lifespan: Option<u64>,
    policy: LockPolicy,
    release: Script,
}

impl RedisCache {
    /// Connect to the configured server.
    ///
    /// The connection manager reconnects on its own after the initial
    /// connection succeeds.
    pub async fn connect(config: RedisConfig) -> Result<Self, CacheError> {
        let url = config.url();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| CacheError::config(format!("Invalid redis address {}: {}", url, e)))?;
        let conn = client.get_connection_manager().await.map_err(redis_err)?;

        info!(url = %url, "Connected to redis");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix,
            lifespan: config.lifespan,
            policy: LockPolicy::default(),
            release: Script::new(COMPARE_AND_DELETE),
        })
    }

    /// Set the lock polling policy.
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Redis key for a tile.
    pub fn tile_key(&self, key: &TileKey) -> String {
        key.object_key(&self.key_prefix)
    }

    /// Redis key for a tile's lock.
    pub fn lock_key(&self, key: &TileKey) -> String {
        format!("{}-lock", self.tile_key(key))
    }

    async fn release_if_held(&self, lock_key: &str, holder: Option<&LockToken>) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = match holder {
            Some(holder) => self
                .release
                .key(lock_key)
                .arg(holder.as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(redis_err)?,
            None => conn.del(lock_key).await.map_err(redis_err)?,
        };
        Ok(deleted > 0)
    }
}

#[allow(clippy::manual_async_fn)]
impl LockMedium for RedisCache {
    fn try_acquire(
        &self,
        key: &TileKey,
        token: &LockToken,
        stale_timeout: Duration,
    ) -> impl std::future::Future<Output = Result<LockAttempt, CacheError>> + Send {
        let lock_key = self.lock_key(key);
        let token = token.clone();
        let ttl_ms = stale_timeout.as_millis().clamp(1, u128::from(u64::MAX)) as u64;
        let mut conn = self.conn.clone();

        async move {
            let set: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(token.as_str())
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;

            if set.is_some() {
                return Ok(LockAttempt::Acquired);
            }

            let holder: Option<String> = conn.get(&lock_key).await.map_err(redis_err)?;
            let remaining_ms: i64 = conn.pttl(&lock_key).await.map_err(redis_err)?;

            // Age follows from the expiry set at acquisition
            let age = u64::try_from(remaining_ms)
                .ok()
                .map(|ms| stale_timeout.saturating_sub(Duration::from_millis(ms)));

            Ok(LockAttempt::Held {
                holder: holder.as_deref().map(LockToken::from_stored),
                age,
            })
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
            self.release_if_held(&lock_key, holder.as_ref()).await?;
            Ok(())
        }
    }
}

impl TileCache for RedisCache {
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
            if !self.release_if_held(&self.lock_key(key), Some(token)).await? {
                debug!(key = %key, token = %token, "Lock no longer held by this token");
            }
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let body: Option<Vec<u8>> = conn.get(self.tile_key(key)).await.map_err(redis_err)?;
            Ok(body.map(Bytes::from))
        })
    }

    fn write<'a>(&'a self, key: &'a TileKey, body: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let rkey = self.tile_key(key);
            let _: () = match self.lifespan {
                Some(secs) if secs > 0 => conn
                    .set_ex(rkey, body.as_ref(), secs)
                    .await
                    .map_err(redis_err)?,
                _ => conn.set(rkey, body.as_ref()).await.map_err(redis_err)?,
            };
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = conn
                .del(vec![self.tile_key(key), self.lock_key(key)])
                .await
                .map_err(redis_err)?;
            Ok(())
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
        let config: RedisConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.url(), "redis://localhost:6379/0");
        assert!(config.key_prefix.is_empty());
    }

    #[test]
    fn test_config_values() {
        let config: RedisConfig = serde_json::from_str(
            r#"{"host": "cache.internal", "port": 6380, "db": 2, "key prefix": "tiles", "lifespan": 3600}"#,
        )
        .unwrap();
        assert_eq!(config.url(), "redis://cache.internal:6380/2");
        assert_eq!(config.key_prefix, "tiles");
        assert_eq!(config.lifespan, Some(3600));
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(key().object_key("tiles"), "tiles/roads/12/656/1582.png");
    }

    #[tokio::test]
    #[ignore] // Requires redis on localhost:6379
    async fn test_redis_live() {
        let cache = RedisCache::connect(RedisConfig {
            key_prefix: "tilevault-test".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .with_lock_policy(LockPolicy::default().with_poll_interval(Duration::from_millis(20)));
        let key = key();

        cache.remove(&key).await.unwrap();
        assert!(cache.read(&key).await.unwrap().is_none());

        let token = cache.lock(&key, Duration::from_secs(5)).await.unwrap();

        // Foreign token leaves the lock in place
        cache.unlock(&key, &LockToken::generate()).await.unwrap();
        let mut conn = cache.conn.clone();
        let held: Option<String> = conn.get(cache.lock_key(&key)).await.unwrap();
        assert_eq!(held.as_deref(), Some(token.as_str()));

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
