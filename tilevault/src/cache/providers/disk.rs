//! Filesystem tile cache.
//!
//! Tiles are stored under a root directory at the path given by the
//! configured [`DirLayout`]. All filesystem work runs on tokio's blocking
//! pool via `spawn_blocking`.
//!
//! # Writes
//!
//! Bodies are written to a temporary file in the destination directory and
//! renamed into place, so readers see either the old body or the new one and
//! never a partial file. Formats listed in `gzip` are stored compressed with a
//! `.gz` suffix and decompressed transparently on read.
//!
//! # Locks
//!
//! A lock is a `{tile path}.lock` file created with exclusive-create
//! semantics and holding the lock token. Its modification time is the
//! acquisition time, so any process sharing the directory can judge whether
//! the lock is stale.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Deserializer};
use tracing::{debug, trace};

use crate::cache::key::{DirLayout, TileKey};
use crate::cache::lock::{self, LockAttempt, LockMedium, LockPolicy, LockToken};
use crate::cache::traits::{BoxFuture, CacheError, TileCache};

/// Formats stored gzip-compressed unless configured otherwise.
pub const DEFAULT_GZIP_FORMATS: &[&str] = &["txt", "text", "json", "xml"];

/// Default permission mask for created files and directories.
pub const DEFAULT_UMASK: u32 = 0o022;

/// Disk cache settings as they appear in the `"cache"` config object.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskCacheConfig {
    /// Cache root directory.
    pub path: PathBuf,

    /// Octal permission mask, e.g. `"0022"`.
    #[serde(default = "default_umask", deserialize_with = "deserialize_umask")]
    pub umask: u32,

    /// Directory layout.
    #[serde(default)]
    pub dirs: DirLayout,

    /// Formats to store gzip-compressed.
    #[serde(default = "default_gzip")]
    pub gzip: Vec<String>,

    /// Seconds after which a cached tile reads as a miss.
    #[serde(default)]
    pub lifespan: Option<u64>,
}

impl DiskCacheConfig {
    /// Settings with defaults for everything but the root.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            umask: DEFAULT_UMASK,
            dirs: DirLayout::default(),
            gzip: default_gzip(),
            lifespan: None,
        }
    }
}

fn default_umask() -> u32 {
    DEFAULT_UMASK
}

fn default_gzip() -> Vec<String> {
    DEFAULT_GZIP_FORMATS.iter().map(|s| s.to_string()).collect()
}

/// Parse an umask given as an octal string.
pub fn parse_umask(value: &str) -> Result<u32, CacheError> {
    let mask = u32::from_str_radix(value.trim(), 8)
        .map_err(|_| CacheError::config(format!("umask {:?} is not an octal number", value)))?;
    if mask > 0o777 {
        return Err(CacheError::config(format!(
            "umask {:?} is out of range",
            value
        )));
    }
    Ok(mask)
}

fn deserialize_umask<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_umask(&value).map_err(serde::de::Error::custom)
}

/// Filesystem-backed tile cache.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    layout: DirLayout,
    gzip: HashSet<String>,
    umask: u32,
    lifespan: Option<Duration>,
    policy: LockPolicy,
}

impl DiskCache {
    /// Create a disk cache rooted at `root` with default settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(DiskCacheConfig::new(root))
    }

    /// Create a disk cache from parsed settings.
    pub fn from_config(config: DiskCacheConfig) -> Self {
        Self {
            root: config.path,
            layout: config.dirs,
            gzip: config.gzip.iter().map(|f| f.to_ascii_lowercase()).collect(),
            umask: config.umask,
            lifespan: config.lifespan.map(Duration::from_secs),
            policy: LockPolicy::default(),
        }
    }

    /// Set the directory layout.
    pub fn with_layout(mut self, layout: DirLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Replace the set of gzip-compressed formats.
    pub fn with_gzip<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.gzip = formats
            .into_iter()
            .map(|f| f.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    /// Set the permission mask for created files and directories.
    pub fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask & 0o777;
        self
    }

    /// Treat tiles older than `lifespan` as missing.
    pub fn with_lifespan(mut self, lifespan: Option<Duration>) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Set the lock polling policy.
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory layout in use.
    pub fn layout(&self) -> DirLayout {
        self.layout
    }

    fn is_compressed(&self, key: &TileKey) -> bool {
        self.gzip.contains(key.format())
    }

    /// Full path of the stored tile, including any `.gz` suffix.
    pub fn tile_path(&self, key: &TileKey) -> PathBuf {
        let suffix = self.is_compressed(key).then_some("gz");
        self.root.join(key.relative_path(self.layout, suffix))
    }

    /// Full path of the tile's lock file.
    pub fn lock_path(&self, key: &TileKey) -> PathBuf {
        let mut path = self
            .root
            .join(key.relative_path(self.layout, None))
            .into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }
}

/// Run filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CacheError::backend("disk", e))?
}

fn create_parent_dirs(path: &Path, umask: u32) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777 & !umask);
    }
    #[cfg(not(unix))]
    let _ = umask;

    builder.create(parent)
}

#[cfg(unix)]
fn set_file_mode(file: &fs::File, umask: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o666 & !umask))
}

#[cfg(not(unix))]
fn set_file_mode(_file: &fs::File, _umask: u32) -> io::Result<()> {
    Ok(())
}

fn age_of(metadata: &fs::Metadata) -> Option<Duration> {
    let modified = metadata.modified().ok()?;
    // Clock skew can put mtime in the future; call that age zero
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

fn read_tile(path: &Path, compressed: bool, lifespan: Option<Duration>) -> io::Result<Option<Bytes>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    if let Some(lifespan) = lifespan {
        let age = age_of(&file.metadata()?).unwrap_or(Duration::ZERO);
        if age > lifespan {
            trace!(path = %path.display(), age_secs = age.as_secs(), "Tile outlived its lifespan");
            return Ok(None);
        }
    }

    let mut body = Vec::new();
    if compressed {
        GzDecoder::new(file).read_to_end(&mut body)?;
    } else {
        file.read_to_end(&mut body)?;
    }
    Ok(Some(Bytes::from(body)))
}

fn write_tile(path: &Path, body: &[u8], compressed: bool, umask: u32) -> io::Result<()> {
    create_parent_dirs(path, umask)?;

    // Temp file in the destination directory keeps the rename on one filesystem
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tile-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    if compressed {
        let mut encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
        encoder.write_all(body)?;
        encoder.finish()?;
    } else {
        tmp.write_all(body)?;
    }

    set_file_mode(tmp.as_file(), umask)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn try_lock_file(path: &Path, token: &LockToken, umask: u32) -> io::Result<LockAttempt> {
    create_parent_dirs(path, umask)?;

    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            file.write_all(token.as_str().as_bytes())?;
            file.sync_data()?;
            Ok(LockAttempt::Acquired)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let age = fs::metadata(path).ok().as_ref().and_then(age_of);
            let holder = match fs::read_to_string(path) {
                Ok(stored) if !stored.trim().is_empty() => Some(LockToken::from_stored(&stored)),
                // Holder hasn't written its token yet, or just released
                Ok(_) => None,
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            Ok(LockAttempt::Held { holder, age })
        }
        Err(e) => Err(e),
    }
}

/// Remove a lock file, only if it still holds `holder` when one is given.
///
/// The compare and the removal are separate filesystem calls; a lock taken
/// over in between by a third process can still be removed.
fn release_lock_file(path: &Path, holder: Option<&LockToken>) -> io::Result<bool> {
    if let Some(holder) = holder {
        match fs::read_to_string(path) {
            Ok(stored) if stored.trim() == holder.as_str() => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[allow(clippy::manual_async_fn)]
impl LockMedium for DiskCache {
    fn try_acquire(
        &self,
        key: &TileKey,
        token: &LockToken,
        _stale_timeout: Duration,
    ) -> impl std::future::Future<Output = Result<LockAttempt, CacheError>> + Send {
        let path = self.lock_path(key);
        let token = token.clone();
        let umask = self.umask;
        async move { blocking(move || Ok(try_lock_file(&path, &token, umask)?)).await }
    }

    fn break_lock(
        &self,
        key: &TileKey,
        holder: Option<&LockToken>,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send {
        let path = self.lock_path(key);
        let holder = holder.cloned();
        async move {
            blocking(move || {
                release_lock_file(&path, holder.as_ref())?;
                Ok(())
            })
            .await
        }
    }
}

impl TileCache for DiskCache {
    fn backend(&self) -> &'static str {
        "disk"
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
        let path = self.lock_path(key);
        let owned = token.clone();
        Box::pin(async move {
            let released = blocking(move || Ok(release_lock_file(&path, Some(&owned))?)).await?;
            if !released {
                debug!(key = %key, token = %token, "Lock no longer held by this token");
            }
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        let path = self.tile_path(key);
        let compressed = self.is_compressed(key);
        let lifespan = self.lifespan;
        Box::pin(async move { blocking(move || Ok(read_tile(&path, compressed, lifespan)?)).await })
    }

    fn write<'a>(&'a self, key: &'a TileKey, body: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        let path = self.tile_path(key);
        let compressed = self.is_compressed(key);
        let umask = self.umask;
        Box::pin(async move {
            blocking(move || Ok(write_tile(&path, &body, compressed, umask)?)).await
        })
    }

    fn remove<'a>(&'a self, key: &'a TileKey) -> BoxFuture<'a, Result<(), CacheError>> {
        let tile = self.tile_path(key);
        let lock = self.lock_path(key);
        Box::pin(async move {
            blocking(move || {
                remove_if_exists(&tile)?;
                remove_if_exists(&lock)?;
                Ok(())
            })
            .await
        })
    }
}
