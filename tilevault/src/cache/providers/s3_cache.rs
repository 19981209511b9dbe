//! S3 tile cache.
//!
//! Works with AWS S3 and S3-compatible services (MinIO and friends) through
//! `rust-s3`. Tiles are objects at `{path}/{layer}/{z}/{x}/{y}.{ext}`; a lock
//! is a `{key}-lock` object holding the lock token.
//!
//! S3 has no conditional create, so lock acquisition writes the lock object
//! and reads it back; a competitor that wrote in between wins. Set
//! `use locks` to false to skip locking entirely.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::cache::key::TileKey;
use crate::cache::lock::{self, LockAttempt, LockMedium, LockPolicy, LockToken};
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

const BACKEND: &str = "s3";

/// S3 settings as they appear in the `"cache"` config object.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible services; enables path-style URLs.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Access key; falls back to the environment when absent.
    #[serde(default)]
    pub access: Option<String>,

    /// Secret key; falls back to the environment when absent.
    #[serde(default)]
    pub secret: Option<String>,

    /// Key prefix inside the bucket.
    #[serde(default)]
    pub path: String,

    #[serde(default = "default_use_locks", rename = "use locks", alias = "use_locks")]
    pub use_locks: bool,

    /// Seconds after which a cached tile reads as a miss.
    #[serde(default)]
    pub lifespan: Option<u64>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_use_locks() -> bool {
    true
}

/// Content type for a tile format.
pub fn content_type(format: &str) -> &'static str {
    match format {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "json" | "geojson" | "topojson" => "application/json",
        "pbf" | "mvt" => "application/x-protobuf",
        "xml" => "text/xml",
        "txt" | "text" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn is_not_found(err: &S3Error) -> bool {
    let message = err.to_string();
    message.contains("404") || message.contains("NoSuchKey")
}

fn s3_err(err: S3Error) -> CacheError {
    CacheError::backend(BACKEND, err)
}

/// Time since an HTTP `Last-Modified` header value.
fn age_from_last_modified(value: &str) -> Option<Duration> {
    let modified = DateTime::parse_from_rfc2822(value).ok()?;
    let age = Utc::now().signed_duration_since(modified);
    Some(age.to_std().unwrap_or(Duration::ZERO))
}

fn last_modified_age(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("last-modified"))
        .and_then(|(_, value)| age_from_last_modified(value))
}

/// S3-backed tile cache.
pub struct S3Cache {
    bucket: Box<Bucket>,
    path: String,
    use_locks: bool,
    lifespan: Option<Duration>,
    policy: LockPolicy,
}

impl S3Cache {
    /// Build a cache for the configured bucket.
    pub fn connect(config: S3Config) -> Result<Self, CacheError> {
        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse()
                .map_err(|e| CacheError::config(format!("Invalid region: {}", e)))?,
        };

        let credentials = match (&config.access, &config.secret) {
            (Some(access), Some(secret)) => {
                Credentials::new(Some(access.as_str()), Some(secret.as_str()), None, None, None)
            }
            (None, None) => Credentials::from_env(),
            _ => {
                return Err(CacheError::config(
                    "s3 cache needs both \"access\" and \"secret\", or neither",
                ))
            }
        }
        .map_err(|e| CacheError::config(format!("Failed to load credentials: {}", e)))?;

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| CacheError::config(format!("Failed to create bucket: {}", e)))?;

        // Custom endpoints generally don't support virtual-hosted style
        let bucket = if config.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            path: config.path,
            use_locks: config.use_locks,
            lifespan: config.lifespan.map(Duration::from_secs),
            policy: LockPolicy::default(),
        })
    }

    /// Set the lock polling policy.
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Object key for a tile.
    pub fn tile_key(&self, key: &TileKey) -> String {
        key.object_key(&self.path)
    }

    /// Object key for a tile's lock.
    pub fn lock_key(&self, key: &TileKey) -> String {
        format!("{}-lock", self.tile_key(key))
    }

    /// Fetch an object, mapping 404 to `None`.
    async fn fetch(&self, object: &str) -> Result<Option<(Bytes, Option<Duration>)>, CacheError> {
        match self.bucket.get_object(object).await {
            Ok(response) => {
                let age = last_modified_age(&response.headers());
                Ok(Some((Bytes::from(response.to_vec()), age)))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(s3_err(e)),
        }
    }

    async fn delete(&self, object: &str) -> Result<(), CacheError> {
        match self.bucket.delete_object(object).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(s3_err(e)),
        }
    }

    async fn delete_lock_if_held(&self, lock_key: &str, holder: Option<&LockToken>) -> Result<bool, CacheError> {
        if let Some(holder) = holder {
            match self.fetch(lock_key).await? {
                Some((stored, _)) if stored.as_ref() == holder.as_str().as_bytes() => {}
                _ => return Ok(false),
            }
        }
        self.delete(lock_key).await?;
        Ok(true)
    }
}

#[allow(clippy::manual_async_fn)]
impl LockMedium for S3Cache {
    fn try_acquire(
        &self,
        key: &TileKey,
        token: &LockToken,
        _stale_timeout: Duration,
    ) -> impl std::future::Future<Output = Result<LockAttempt, CacheError>> + Send {
        let lock_key = self.lock_key(key);
        let token = token.clone();
        async move {
            let held = |stored: Bytes, age: Option<Duration>| LockAttempt::Held {
                holder: Some(LockToken::from_stored(&String::from_utf8_lossy(&stored))),
                age,
            };

            if let Some((stored, age)) = self.fetch(&lock_key).await? {
                return Ok(held(stored, age));
            }

            self.bucket
                .put_object_with_content_type(&lock_key, token.as_str().as_bytes(), "text/plain")
                .await
                .map_err(s3_err)?;

            // Read back: a competitor writing at the same moment may have won
            match self.fetch(&lock_key).await? {
                Some((stored, _)) if stored.as_ref() == token.as_str().as_bytes() => {
                    Ok(LockAttempt::Acquired)
                }
                Some((stored, age)) => Ok(held(stored, age)),
                None => Ok(LockAttempt::Held {
                    holder: None,
                    age: Some(Duration::ZERO),
                }),
            }
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
            self.delete_lock_if_held(&lock_key, holder.as_ref()).await?;
            Ok(())
        }
    }
}

impl TileCache for S3Cache {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn lock<'a>(
        &'a self,
        key: &'a TileKey,
        stale_timeout: Duration,
    ) -> BoxFuture<'a, Result<LockToken, CacheError>> {
        Box::pin(async move {
            if !self.use_locks {
                return Ok(LockToken::generate());
            }
            lock::acquire(self, key, stale_timeout, &self.policy).await
        })
    }

    fn unlock<'a>(
        &'a self,
        key: &'a TileKey,
        token: &'a LockToken,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            if !self.use_locks {
                return Ok(());
            }
            if !self.delete_lock_if_held(&self.lock_key(key), Some(token)).await? {
                debug!(key = %key, token = %token, "Lock no longer held by this token");
            }
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move {
            let Some((body, age)) = self.fetch(&self.tile_key(key)).await? else {
                return Ok(None);
            };

            if let (Some(lifespan), Some(age)) = (self.lifespan, age) {
                if age > lifespan {
                    trace!(key = %key, age_secs = age.as_secs(), "Tile outlived its lifespan");
                    return Ok(None);
                }
            }

            Ok(Some(body))
        })
    }

    fn write<'a>(&'a self, key: &'a TileKey, body: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.bucket
                .put_object_with_content_type(&self.tile_key(key), &body, content_type(key.format()))
                .await
                .map_err(s3_err)?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.delete(&self.tile_key(key)).await?;
            if self.use_locks {
                self.delete(&self.lock_key(key)).await?;
            }
            Ok(())
        })
    }
}
