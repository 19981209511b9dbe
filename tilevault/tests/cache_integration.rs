//! Integration tests for the tile cache.
//!
//! These tests exercise the public cache API end to end:
//! - Memory and disk tiers composed into a multi-tier cache
//! - Lock contention between independent disk cache handles
//! - Stale lock recovery on disk, including locks handed to a new holder
//! - Startup from a JSON config file
//!
//! Run with: `cargo test --test cache_integration`

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use tempfile::TempDir;

use tilevault::app::{AppConfig, TileVaultApp};
use tilevault::cache::{
    BoxFuture, DirLayout, DiskCache, LockPolicy, MemoryCache, MultiTierCache, TileCache, TileKey,
};
use tilevault::coord::TileCoord;
use tilevault::layer::{RenderError, TileOrigin, TileRenderer};

// ============================================================================
// Helper Functions
// ============================================================================

/// The roads tile at 12/656/1582.
fn roads_key() -> TileKey {
    TileKey::new("roads", TileCoord::new(12, 656, 1582).unwrap(), "png").unwrap()
}

fn fast_policy() -> LockPolicy {
    LockPolicy::default().with_poll_interval(Duration::from_millis(10))
}

fn disk_cache(dir: &TempDir) -> DiskCache {
    DiskCache::new(dir.path())
        .with_layout(DirLayout::Portable)
        .with_lock_policy(fast_policy())
}

struct EchoRenderer;

impl TileRenderer for EchoRenderer {
    fn render<'a>(
        &'a self,
        layer: &'a str,
        coord: TileCoord,
        format: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, RenderError>> {
        let body = format!("{}@{}.{}", layer, coord, format);
        Box::pin(async move { Ok(Bytes::from(body)) })
    }
}

// ============================================================================
// Multi-Tier
// ============================================================================

#[tokio::test]
async fn test_slow_tier_hit_is_promoted() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemoryCache::default());
    let disk = Arc::new(disk_cache(&dir));
    let multi = MultiTierCache::new(vec![
        memory.clone() as Arc<dyn TileCache>,
        disk.clone() as Arc<dyn TileCache>,
    ])
    .unwrap();

    let key = roads_key();
    disk.write(&key, Bytes::from_static(b"from disk")).await.unwrap();

    let body = multi.read(&key).await.unwrap();
    assert_eq!(body, Some(Bytes::from_static(b"from disk")));
    assert_eq!(
        memory.read(&key).await.unwrap(),
        Some(Bytes::from_static(b"from disk"))
    );

    // Second read is served by the memory tier
    multi.read(&key).await.unwrap();
    let stats = multi.stats();
    assert_eq!(stats.hits, vec![1, 1]);
    assert_eq!(stats.promotions, 1);
    assert_eq!(stats.misses, 0);
}

#[tokio::test]
async fn test_write_and_remove_fan_out() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemoryCache::default());
    let disk = Arc::new(disk_cache(&dir));
    let multi = MultiTierCache::new(vec![
        memory.clone() as Arc<dyn TileCache>,
        disk.clone() as Arc<dyn TileCache>,
    ])
    .unwrap();

    let key = roads_key();
    multi.write(&key, Bytes::from_static(b"tile")).await.unwrap();
    assert!(memory.read(&key).await.unwrap().is_some());
    assert!(disk.read(&key).await.unwrap().is_some());
    assert!(dir.path().join("roads/12/656/1582.png").exists());

    multi.remove(&key).await.unwrap();
    assert!(memory.read(&key).await.unwrap().is_none());
    assert!(disk.read(&key).await.unwrap().is_none());
    assert!(multi.read(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_multi_lock_lives_in_first_tier() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemoryCache::default().with_lock_policy(fast_policy()));
    let disk = Arc::new(disk_cache(&dir));
    let multi = MultiTierCache::new(vec![
        memory.clone() as Arc<dyn TileCache>,
        disk.clone() as Arc<dyn TileCache>,
    ])
    .unwrap();

    let key = roads_key();
    let token = multi.lock(&key, Duration::from_secs(5)).await.unwrap();
    assert_eq!(memory.held_locks(), 1);
    assert!(!disk.lock_path(&key).exists());

    multi
        .save(&key, Bytes::from_static(b"tile"), Some(&token))
        .await
        .unwrap();
    assert_eq!(memory.held_locks(), 0);
    assert!(disk.read(&key).await.unwrap().is_some());
}

// ============================================================================
// Disk Locking
// ============================================================================

#[tokio::test]
async fn test_disk_lock_contention_between_handles() {
    let dir = TempDir::new().unwrap();
    let first = disk_cache(&dir);
    let second = disk_cache(&dir);
    let key = roads_key();

    let token = first.lock(&key, Duration::from_secs(5)).await.unwrap();

    let waiter = {
        let key = key.clone();
        tokio::spawn(async move {
            let token = second.lock(&key, Duration::from_secs(5)).await.unwrap();
            let body = second.read(&key).await.unwrap();
            second.unlock(&key, &token).await.unwrap();
            body
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    first
        .save(&key, Bytes::from_static(b"rendered once"), Some(&token))
        .await
        .unwrap();

    // The waiter only gets the lock after the tile was saved
    let seen = waiter.await.unwrap();
    assert_eq!(seen, Some(Bytes::from_static(b"rendered once")));
    assert!(!first.lock_path(&key).exists());
}

#[tokio::test]
async fn test_stale_disk_lock_is_recovered() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir);
    let key = roads_key();

    // A lock left behind by a crashed renderer
    let lock_path = cache.lock_path(&key);
    std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    std::fs::write(&lock_path, "crashed-renderer").unwrap();
    let minute_ago = SystemTime::now() - Duration::from_secs(60);
    filetime::set_file_mtime(&lock_path, FileTime::from_system_time(minute_ago)).unwrap();

    let token = cache.lock(&key, Duration::from_secs(1)).await.unwrap();
    let stored = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(stored, token.as_str());

    cache.unlock(&key, &token).await.unwrap();
    assert!(!lock_path.exists());
}

#[tokio::test]
async fn test_handed_off_disk_lock_gets_full_stale_timeout() {
    let dir = TempDir::new().unwrap();
    let first = disk_cache(&dir);
    let waiting = disk_cache(&dir);
    let key = roads_key();
    let stale = Duration::from_secs(1);

    let token = first.lock(&key, stale).await.unwrap();

    let waiter = {
        let key = key.clone();
        tokio::spawn(async move {
            let token = waiting.lock(&key, stale).await.unwrap();
            (token, Instant::now())
        })
    };

    // Another renderer takes over the lock file late in the first hold
    tokio::time::sleep(Duration::from_millis(700)).await;
    let lock_path = first.lock_path(&key);
    std::fs::write(&lock_path, "renderer-b").unwrap();
    let handoff = Instant::now();

    let (waiter_token, acquired_at) = waiter.await.unwrap();
    assert!(acquired_at.duration_since(handoff) >= stale);
    assert_ne!(waiter_token, token);
    assert_eq!(
        std::fs::read_to_string(&lock_path).unwrap(),
        waiter_token.as_str()
    );
}

#[tokio::test]
async fn test_last_writer_wins() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir);
    let key = roads_key();

    cache.write(&key, Bytes::from_static(b"first")).await.unwrap();
    cache.write(&key, Bytes::from_static(b"second")).await.unwrap();
    assert_eq!(
        cache.read(&key).await.unwrap(),
        Some(Bytes::from_static(b"second"))
    );

    cache.remove(&key).await.unwrap();
    assert!(cache.read(&key).await.unwrap().is_none());
    // Removing again is fine
    cache.remove(&key).await.unwrap();
}

// ============================================================================
// Application
// ============================================================================

#[tokio::test]
async fn test_app_from_config_file() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("tilevault.json");
    let mut file = std::fs::File::create(&config_path).unwrap();
    write!(
        file,
        r#"{{
            "cache": {{
                "name": "multi",
                "tiers": [
                    {{"name": "memory"}},
                    {{"name": "disk", "path": "tiles", "dirs": "portable"}}
                ]
            }},
            "layers": {{
                "roads": {{"stale lock timeout": 5}}
            }}
        }}"#
    )
    .unwrap();

    let config = AppConfig::load(&config_path).unwrap();
    let app = TileVaultApp::start(config).await.unwrap();
    assert_eq!(app.cache().backend(), "multi");

    let roads = app.layer("roads").unwrap();
    let coord = TileCoord::new(12, 656, 1582).unwrap();

    let first = roads.get_tile(coord, "PNG", &EchoRenderer, false).await.unwrap();
    assert_eq!(first.origin, TileOrigin::Rendered);
    assert!(dir.path().join("tiles/roads/12/656/1582.png").exists());

    let second = roads.get_tile(coord, "png", &EchoRenderer, false).await.unwrap();
    assert_eq!(second.origin, TileOrigin::Cache);
    assert_eq!(second.body, first.body);
}
