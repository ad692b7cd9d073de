//! Disk-based image cache bounded by total file size.
//!
//! Entries are encoded images, one file per key. Recency is the file's
//! modification time: writes set it and reads bump it. Trimming to budget
//! runs on the storage pool and is single-flight.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::domain::entities::ImageKey;
use crate::domain::errors::{ConfigError, StorageError, StorageResult};
use crate::infrastructure::executors::WorkerPool;

/// Default storage budget in bytes (64 MB).
pub const DEFAULT_MAX_STORAGE_SIZE: u64 = 64 * 1024 * 1024;

const ENTRY_EXTENSION: &str = "img";

/// Encoding used for persisted images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum StorageFormat {
    /// Lossless PNG.
    #[default]
    Png,
    /// JPEG at the given quality (1-100).
    Jpeg {
        /// Encoder quality.
        quality: u8,
    },
    /// Lossless WebP.
    Webp,
}

impl StorageFormat {
    /// Encodes `image` into a byte buffer.
    ///
    /// # Errors
    /// Returns `Encode` if the encoder rejects the image.
    pub fn encode(self, image: &image::DynamicImage) -> StorageResult<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        let result = match self {
            Self::Png => image.write_to(&mut buffer, image::ImageFormat::Png),
            Self::Webp => image.write_to(&mut buffer, image::ImageFormat::WebP),
            Self::Jpeg { quality } => {
                let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    &mut buffer,
                    quality.clamp(1, 100),
                );
                // JPEG has no alpha channel.
                image.to_rgb8().write_with_encoder(encoder)
            }
        };
        result.map_err(|e| StorageError::Encode(e.to_string()))?;
        Ok(buffer.into_inner())
    }
}

/// Options for a [`StorageImageCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    /// Directory holding the cache files.
    pub dir: PathBuf,
    /// Budget in bytes.
    pub max_size: u64,
    /// Encoding for new entries.
    pub format: StorageFormat,
}

impl StorageOptions {
    /// Options for `dir` with default budget and format.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_size: DEFAULT_MAX_STORAGE_SIZE,
            format: StorageFormat::default(),
        }
    }

    /// Sets the byte budget.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the encoding.
    #[must_use]
    pub const fn with_format(mut self, format: StorageFormat) -> Self {
        self.format = format;
        self
    }
}

/// Outcome of one pass of trimming to budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitReport {
    /// Entries kept.
    pub kept: usize,
    /// Bytes kept.
    pub kept_bytes: u64,
    /// Entries deleted.
    pub removed: usize,
    /// Bytes deleted.
    pub removed_bytes: u64,
}

/// Disk-based image cache that persists encoded images.
pub struct StorageImageCache {
    shared: Arc<Shared>,
    format: StorageFormat,
    pool: Arc<WorkerPool>,
}

struct Shared {
    dir: PathBuf,
    max_size: u64,
    running: AtomicBool,
    rerun: AtomicBool,
    passes: AtomicU64,
    idle: Notify,
    /// Serializes writes, touches and deletes against trimming.
    files: Mutex<()>,
}

/// Clears the worker flag if a trimming pass unwinds.
struct MaintainGuard<'a> {
    shared: &'a Shared,
    done: bool,
}

struct Entry {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

impl StorageImageCache {
    /// Opens (creating if needed) a cache in `options.dir` and schedules an
    /// initial trim.
    ///
    /// # Errors
    /// Returns `ZeroBudget` for a zero budget and `Io` if the directory
    /// cannot be created.
    pub async fn open(options: StorageOptions, pool: Arc<WorkerPool>) -> Result<Self, OpenError> {
        if options.max_size == 0 {
            return Err(ConfigError::ZeroBudget {
                name: "storage cache",
            }
            .into());
        }
        fs::create_dir_all(&options.dir)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to create cache dir: {e}")))?;

        let cache = Self {
            shared: Arc::new(Shared {
                dir: options.dir,
                max_size: options.max_size,
                running: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                passes: AtomicU64::new(0),
                idle: Notify::new(),
                files: Mutex::new(()),
            }),
            format: options.format,
            pool,
        };
        debug!(dir = %cache.shared.dir.display(), max_size = cache.shared.max_size, "Opened storage image cache");
        cache.request_fit();
        Ok(cache)
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Returns the byte budget.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.shared.max_size
    }

    /// Returns the path backing `key`.
    #[must_use]
    pub fn path_for(&self, key: &ImageKey) -> PathBuf {
        self.shared.path_for(key)
    }

    /// Reads the encoded bytes for `key` and bumps its recency.
    ///
    /// A missing entry is `None`, not an error.
    pub async fn get_bytes(&self, key: &ImageKey) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Storage cache hit");
                let _files = self.shared.files.lock().await;
                if let Err(e) = touch(path).await {
                    debug!(key = %key, error = %e, "Failed to bump storage entry");
                }
                Some(bytes)
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to read storage entry");
                }
                trace!(key = %key, "Storage cache miss");
                None
            }
        }
    }

    /// Loads and decodes the image for `key`.
    ///
    /// An entry that fails to decode is deleted and reported as a miss.
    pub async fn get(&self, key: &ImageKey) -> Option<image::DynamicImage> {
        let bytes = self.get_bytes(key).await?;

        let result = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await;

        match result {
            Ok(Ok(img)) => {
                debug!(key = %key, "Decoded image from storage cache");
                Some(img)
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Dropping undecodable storage entry");
                self.remove(key).await;
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Decode task failed");
                None
            }
        }
    }

    /// Stores encoded bytes under `key`, replacing any previous entry, then
    /// schedules a trim.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be written.
    pub async fn put_bytes(&self, key: &ImageKey, bytes: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key);
        let dir = self.shared.dir.clone();
        let size = bytes.len();
        let target = path.clone();

        {
            let _files = self.shared.files.lock().await;
            tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &bytes))
                .await
                .map_err(|e| StorageError::Io(format!("Write task failed: {e}")))??;
        }

        debug!(key = %key, path = %path.display(), size, "Stored image in storage cache");
        self.request_fit();
        Ok(())
    }

    /// Encodes `image` with the configured format and stores it.
    ///
    /// # Errors
    /// Returns `Encode` or `Io` on failure.
    pub async fn put(&self, key: &ImageKey, image: Arc<image::DynamicImage>) -> StorageResult<()> {
        let format = self.format;
        let bytes = tokio::task::spawn_blocking(move || format.encode(&image))
            .await
            .map_err(|e| StorageError::Encode(format!("Encode task failed: {e}")))??;
        self.put_bytes(key, bytes).await
    }

    /// Removes the entry for `key`.
    pub async fn remove(&self, key: &ImageKey) -> bool {
        let path = self.path_for(key);
        let _files = self.shared.files.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Removed from storage cache");
                true
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to remove from storage cache");
                }
                false
            }
        }
    }

    /// Checks if `key` is stored.
    pub async fn contains(&self, key: &ImageKey) -> bool {
        fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Deletes every entry.
    ///
    /// # Errors
    /// Returns `Io` if the directory cannot be listed.
    pub async fn clear(&self) -> StorageResult<()> {
        let _files = self.shared.files.lock().await;
        let entries = self.shared.scan().await?;
        let count = entries.len();
        for entry in entries {
            if let Err(e) = fs::remove_file(&entry.path).await {
                warn!(path = %entry.path.display(), error = %e, "Failed to remove cache file");
            }
        }
        debug!(count, "Cleared storage cache");
        Ok(())
    }

    /// Returns `(entries, bytes)` currently on disk.
    ///
    /// # Errors
    /// Returns `Io` if the directory cannot be listed.
    pub async fn usage(&self) -> StorageResult<(usize, u64)> {
        let entries = self.shared.scan().await?;
        let bytes = entries.iter().map(|e| e.size).sum();
        Ok((entries.len(), bytes))
    }

    /// Runs one trimming pass on the calling task.
    ///
    /// # Errors
    /// Returns `Io` if the directory cannot be listed.
    pub async fn fit_to_budget(&self) -> StorageResult<FitReport> {
        self.shared.fit_to_budget().await
    }

    /// Schedules a trimming pass on the storage pool.
    ///
    /// If a pass is already running, the request is folded into one more
    /// pass after it. Returns true if this call started a new worker.
    pub fn request_fit(&self) -> bool {
        let shared = &self.shared;
        if shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = Arc::clone(shared);
            self.pool.spawn(async move { shared.maintain().await });
            true
        } else {
            shared.rerun.store(true, Ordering::Release);
            trace!("Storage trim already running, requested rerun");
            false
        }
    }

    /// Returns true while a trimming worker is active.
    #[must_use]
    pub fn is_maintaining(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of background trimming passes completed.
    #[must_use]
    pub fn passes_completed(&self) -> u64 {
        self.shared.passes.load(Ordering::Acquire)
    }

    /// Waits until no trimming worker is active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if !self.is_maintaining() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for StorageImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageImageCache")
            .field("dir", &self.shared.dir)
            .field("max_size", &self.shared.max_size)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn path_for(&self, key: &ImageKey) -> PathBuf {
        self.dir
            .join(format!("{}.{ENTRY_EXTENSION}", key.file_stem()))
    }

    /// Background worker body: repeat passes while reruns are requested.
    async fn maintain(&self) {
        let mut guard = MaintainGuard {
            shared: self,
            done: false,
        };
        loop {
            match self.fit_to_budget().await {
                Ok(report) if report.removed > 0 => debug!(
                    removed = report.removed,
                    freed = report.removed_bytes,
                    kept_bytes = report.kept_bytes,
                    "Storage cache trimmed"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Storage cache trim failed"),
            }
            self.passes.fetch_add(1, Ordering::AcqRel);

            if self.rerun.swap(false, Ordering::AcqRel) {
                continue;
            }
            self.running.store(false, Ordering::Release);
            // A request may have landed between the swap and the store.
            if self.rerun.swap(false, Ordering::AcqRel)
                && self
                    .running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                continue;
            }
            break;
        }
        guard.done = true;
    }

    async fn scan(&self) -> StorageResult<Vec<Entry>> {
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read cache dir: {e}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != ENTRY_EXTENSION) {
                continue;
            }
            if let Ok(meta) = entry.metadata().await
                && meta.is_file()
            {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                entries.push(Entry {
                    path,
                    modified,
                    size: meta.len(),
                });
            }
        }
        Ok(entries)
    }

    /// Keeps the most recent entries whose cumulative size fits the budget
    /// and deletes everything from the first entry that overflows it.
    ///
    /// Holds the file lock from listing to the last delete so a concurrent
    /// put cannot be removed through a stale listing.
    async fn fit_to_budget(&self) -> StorageResult<FitReport> {
        let _files = self.files.lock().await;
        let mut entries = self.scan().await?;
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));

        let mut report = FitReport::default();
        let mut total = 0u64;
        let mut overflowed = false;

        for entry in entries {
            if !overflowed {
                total += entry.size;
                overflowed = total > self.max_size;
            }
            if !overflowed {
                report.kept += 1;
                report.kept_bytes += entry.size;
                continue;
            }
            match fs::remove_file(&entry.path).await {
                Ok(()) => {
                    trace!(path = %entry.path.display(), "Removed old cache file");
                    report.removed += 1;
                    report.removed_bytes += entry.size;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "Failed to remove old cache file");
                }
            }
        }
        Ok(report)
    }
}

impl Drop for MaintainGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!("Storage trim worker stopped early");
            self.shared.running.store(false, Ordering::Release);
        }
        self.shared.idle.notify_waiters();
    }
}

/// Error returned by [`StorageImageCache::open`].
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// Invalid options.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The directory could not be prepared.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Writes `bytes` to a temp file in `dir` and renames it over `target`.
fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| StorageError::Io(format!("Failed to create cache file: {e}")))?;
    temp.write_all(bytes)
        .map_err(|e| StorageError::Io(format!("Failed to write cache file: {e}")))?;
    temp.flush()
        .map_err(|e| StorageError::Io(format!("Failed to flush cache file: {e}")))?;
    temp.persist(target)
        .map_err(|e| StorageError::Io(format!("Failed to persist cache file: {}", e.error)))?;
    Ok(())
}

/// Sets the modification time of `path` to now.
async fn touch(path: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .append(true)
            .open(&path)?
            .set_modified(SystemTime::now())
    })
    .await
    .map_err(std::io::Error::other)?
}
