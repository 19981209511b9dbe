//! Cache registry.
//!
//! Maps the `"name"` tag of a cache config object to a factory that builds
//! the cache. The table is filled at startup with the built-in backends and
//! can be extended by applications before any cache is built:
//!
//! ```ignore
//! let mut registry = CacheRegistry::with_builtins();
//! registry.register("custom", build_custom_cache);
//!
//! let config = serde_json::json!({
//!     "name": "multi",
//!     "tiers": [
//!         {"name": "memory", "size": 67108864},
//!         {"name": "disk", "path": "/var/cache/tiles", "dirs": "portable"}
//!     ]
//! });
//! let cache = registry.build(&config, &BuildContext::default()).await?;
//! ```
//!
//! Names are case-insensitive. Unknown names and invalid settings are
//! [`CacheError::Configuration`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::multi::MultiTierCache;
use crate::cache::providers::{DiskCache, DiskCacheConfig, MemoryCache, TestCache, DEFAULT_MEMORY_CACHE_BYTES};
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

/// Builds a cache from its config object.
///
/// The registry is passed in so composite caches can build their parts.
pub type CacheFactory = for<'a> fn(
    &'a CacheRegistry,
    &'a BuildContext,
    &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>>;

/// Environment a cache is built in.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Directory relative paths are resolved against (usually the directory
    /// of the config file).
    pub base_dir: Option<PathBuf>,
    /// Raise the log level of caches that support it.
    pub verbose: bool,
}

impl BuildContext {
    /// Context resolving relative paths against `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            verbose: false,
        }
    }

    /// Resolve `path` against the base directory if it is relative.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Table of cache factories by name.
#[derive(Clone)]
pub struct CacheRegistry {
    factories: HashMap<String, CacheFactory>,
}

impl CacheRegistry {
    /// Registry with no factories.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in backend enabled in this build.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("test", build_test);
        registry.register("memory", build_memory);
        registry.register("disk", build_disk);
        registry.register("multi", build_multi);

        #[cfg(feature = "memcache")]
        registry.register("memcache", build_memcache);
        #[cfg(feature = "redis")]
        registry.register("redis", build_redis);
        #[cfg(feature = "s3")]
        registry.register("s3", build_s3);

        registry
    }

    /// Register a factory, returning the one it replaces.
    pub fn register(&mut self, name: &str, factory: CacheFactory) -> Option<CacheFactory> {
        self.factories.insert(name.to_ascii_lowercase(), factory)
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the cache described by `config`.
    pub fn build<'a>(
        &'a self,
        config: &'a Value,
        ctx: &'a BuildContext,
    ) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
        Box::pin(async move {
            let name = config
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| CacheError::config("cache config needs a \"name\" string"))?;

            let factory = self
                .factories
                .get(&name.to_ascii_lowercase())
                .ok_or_else(|| {
                    CacheError::config(format!(
                        "Unknown cache name {:?}, expected one of: {}",
                        name,
                        self.names().join(", ")
                    ))
                })?;

            debug!(name = %name, "Building cache");
            factory(self, ctx, config).await
        })
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Deserialize a backend's settings from its config object.
pub fn parse_settings<T: DeserializeOwned>(backend: &str, config: &Value) -> Result<T, CacheError> {
    T::deserialize(config)
        .map_err(|e| CacheError::config(format!("Invalid {} cache settings: {}", backend, e)))
}

fn shared<C: TileCache + 'static>(cache: C) -> Arc<dyn TileCache> {
    Arc::new(cache)
}

#[derive(Debug, Default, Deserialize)]
struct TestSettings {
    #[serde(default)]
    verbose: bool,
}

fn build_test<'a>(
    _registry: &'a CacheRegistry,
    ctx: &'a BuildContext,
    config: &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
    Box::pin(async move {
        let settings: TestSettings = parse_settings("test", config)?;
        Ok(shared(TestCache::new().with_verbose(settings.verbose || ctx.verbose)))
    })
}

#[derive(Debug, Deserialize)]
struct MemorySettings {
    #[serde(default = "default_memory_size", alias = "max_size_bytes")]
    size: u64,
    #[serde(default)]
    lifespan: Option<u64>,
}

fn default_memory_size() -> u64 {
    DEFAULT_MEMORY_CACHE_BYTES
}

fn build_memory<'a>(
    _registry: &'a CacheRegistry,
    _ctx: &'a BuildContext,
    config: &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
    Box::pin(async move {
        let settings: MemorySettings = parse_settings("memory", config)?;
        let ttl = settings.lifespan.map(Duration::from_secs);
        Ok(shared(MemoryCache::new(settings.size, ttl)))
    })
}

fn build_disk<'a>(
    _registry: &'a CacheRegistry,
    ctx: &'a BuildContext,
    config: &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
    Box::pin(async move {
        let mut settings: DiskCacheConfig = parse_settings("disk", config)?;
        settings.path = ctx.resolve_path(&settings.path);
        Ok(shared(DiskCache::from_config(settings)))
    })
}

#[derive(Debug, Deserialize)]
struct MultiSettings {
    tiers: Vec<Value>,
    #[serde(default = "default_promote", rename = "promote on read", alias = "promote_on_read")]
    promote_on_read: bool,
}

fn default_promote() -> bool {
    true
}

fn build_multi<'a>(
    registry: &'a CacheRegistry,
    ctx: &'a BuildContext,
    config: &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
    Box::pin(async move {
        let settings: MultiSettings = parse_settings("multi", config)?;

        let mut tiers = Vec::with_capacity(settings.tiers.len());
        for tier in &settings.tiers {
            tiers.push(registry.build(tier, ctx).await?);
        }

        let multi = MultiTierCache::new(tiers)?.with_promote_on_read(settings.promote_on_read);
        Ok(shared(multi))
    })
}

#[cfg(feature = "memcache")]
fn build_memcache<'a>(
    _registry: &'a CacheRegistry,
    _ctx: &'a BuildContext,
    config: &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
    use crate::cache::providers::{MemcacheCache, MemcacheConfig};

    Box::pin(async move {
        let settings: MemcacheConfig = parse_settings("memcache", config)?;
        // The client connects eagerly and blocks while doing so
        let cache = tokio::task::spawn_blocking(move || MemcacheCache::connect(settings))
            .await
            .map_err(|e| CacheError::backend("memcache", e))??;
        Ok(shared(cache))
    })
}

#[cfg(feature = "redis")]
fn build_redis<'a>(
    _registry: &'a CacheRegistry,
    _ctx: &'a BuildContext,
    config: &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
    use crate::cache::providers::{RedisCache, RedisConfig};

    Box::pin(async move {
        let settings: RedisConfig = parse_settings("redis", config)?;
        Ok(shared(RedisCache::connect(settings).await?))
    })
}

#[cfg(feature = "s3")]
fn build_s3<'a>(
    _registry: &'a CacheRegistry,
    _ctx: &'a BuildContext,
    config: &'a Value,
) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
    use crate::cache::providers::{S3Cache, S3Config};

    Box::pin(async move {
        let settings: S3Config = parse_settings("s3", config)?;
        Ok(shared(S3Cache::connect(settings)?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_names() {
        let registry = CacheRegistry::with_builtins();
        for name in ["test", "memory", "disk", "multi"] {
            assert!(registry.contains(name), "missing {}", name);
        }
        assert!(registry.contains("Disk"));
        assert!(!registry.contains("mbtiles"));
    }

    #[tokio::test]
    async fn test_build_by_name_case_insensitive() {
        let registry = CacheRegistry::with_builtins();
        let ctx = BuildContext::default();

        let cache = registry.build(&json!({"name": "Test"}), &ctx).await.unwrap();
        assert_eq!(cache.backend(), "test");

        let cache = registry
            .build(&json!({"name": "memory", "size": 1024}), &ctx)
            .await
            .unwrap();
        assert_eq!(cache.backend(), "memory");
    }

    #[tokio::test]
    async fn test_unknown_name_is_configuration_error() {
        let registry = CacheRegistry::with_builtins();
        let result = registry
            .build(&json!({"name": "mbtiles"}), &BuildContext::default())
            .await;

        match result {
            Err(CacheError::Configuration(message)) => {
                assert!(message.contains("mbtiles"));
                assert!(message.contains("disk"));
            }
            Err(other) => panic!("expected configuration error, got {}", other),
            Ok(_) => panic!("expected configuration error"),
        }
    }

    #[tokio::test]
    async fn test_missing_name_and_fields() {
        let registry = CacheRegistry::with_builtins();
        let ctx = BuildContext::default();

        assert!(matches!(
            registry.build(&json!({"path": "/tmp"}), &ctx).await,
            Err(CacheError::Configuration(_))
        ));
        assert!(matches!(
            registry.build(&json!({"name": "disk"}), &ctx).await,
            Err(CacheError::Configuration(_))
        ));
        assert!(matches!(
            registry.build(&json!({"name": "multi", "tiers": []}), &ctx).await,
            Err(CacheError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_build_multi_recursively() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = CacheRegistry::with_builtins();
        let ctx = BuildContext::with_base_dir(dir.path());

        let config = json!({
            "name": "multi",
            "promote on read": false,
            "tiers": [
                {"name": "memory"},
                {"name": "disk", "path": "tiles", "dirs": "portable"}
            ]
        });

        let cache = registry.build(&config, &ctx).await.unwrap();
        assert_eq!(cache.backend(), "multi");

        let key = crate::cache::TileKey::new(
            "roads",
            crate::coord::TileCoord::new(1, 0, 1).unwrap(),
            "png",
        )
        .unwrap();
        cache
            .write(&key, bytes::Bytes::from_static(b"tile"))
            .await
            .unwrap();

        // Relative disk path resolved against the base directory
        assert!(dir.path().join("tiles/roads/1/0/1.png").exists());
    }

    #[tokio::test]
    async fn test_custom_factory() {
        fn build_custom<'a>(
            _registry: &'a CacheRegistry,
            _ctx: &'a BuildContext,
            _config: &'a Value,
        ) -> BoxFuture<'a, Result<Arc<dyn TileCache>, CacheError>> {
            Box::pin(async { Ok(shared(TestCache::new())) })
        }

        let mut registry = CacheRegistry::empty();
        assert!(registry.register("Custom", build_custom).is_none());
        assert_eq!(registry.names(), vec!["custom"]);

        let cache = registry
            .build(&json!({"name": "CUSTOM"}), &BuildContext::default())
            .await
            .unwrap();
        assert_eq!(cache.backend(), "test");
    }

    #[test]
    fn test_resolve_path() {
        let ctx = BuildContext::with_base_dir("/etc/tilevault");
        assert_eq!(
            ctx.resolve_path(Path::new("cache")),
            PathBuf::from("/etc/tilevault/cache")
        );
        assert_eq!(
            ctx.resolve_path(Path::new("/var/cache")),
            PathBuf::from("/var/cache")
        );
        assert_eq!(
            BuildContext::default().resolve_path(Path::new("cache")),
            PathBuf::from("cache")
        );
    }
}
