//! In-memory LRU image cache bounded by decoded byte size.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CachedImage, ImageKey};
use crate::domain::errors::ConfigError;

/// Smallest accepted fraction of the memory baseline.
pub const MIN_MEMORY_FRACTION: f32 = 0.1;
/// Largest accepted fraction of the memory baseline.
pub const MAX_MEMORY_FRACTION: f32 = 0.8;
/// Fraction used when none is configured.
pub const DEFAULT_MEMORY_FRACTION: f32 = 0.25;
/// Memory baseline used when the system cannot be measured (256 MiB).
pub const FALLBACK_MEMORY_BASELINE: u64 = 256 * 1024 * 1024;

/// Measures the memory available to the process, in bytes.
///
/// Reads `MemAvailable` from `/proc/meminfo`, then `MemTotal`, and falls
/// back to [`FALLBACK_MEMORY_BASELINE`].
#[cfg(target_os = "linux")]
#[must_use]
pub fn detect_memory_baseline() -> u64 {
    let measured = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| parse_meminfo(&content));
    if let Some(bytes) = measured {
        debug!(bytes, "Measured memory baseline");
        return bytes;
    }
    debug!("Could not read /proc/meminfo, using fallback memory baseline");
    FALLBACK_MEMORY_BASELINE
}

/// Measures the memory available to the process, in bytes.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub const fn detect_memory_baseline() -> u64 {
    FALLBACK_MEMORY_BASELINE
}

/// Extracts `MemAvailable` (or `MemTotal`) in bytes from meminfo text.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> Option<u64> {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            // Format: "MemAvailable:    8123456 kB"
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            (kb > 0).then_some(kb * 1024)
        })
    };
    field("MemAvailable").or_else(|| field("MemTotal"))
}

/// In-memory LRU cache for decoded images.
///
/// The LRU order, the entries and the resident byte count sit behind one
/// lock, so a lookup never observes a half-finished eviction.
pub struct MemoryImageCache {
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct Inner {
    entries: LruCache<ImageKey, Arc<CachedImage>>,
    size: usize,
    budget: usize,
    evictions: u64,
}

impl Inner {
    /// Pops least-recently-used entries until the size fits the budget.
    fn trim(&mut self, evicted: &mut Vec<Arc<CachedImage>>) {
        while self.size > self.budget {
            let Some((key, image)) = self.entries.pop_lru() else {
                break;
            };
            self.size = self.size.saturating_sub(image.byte_size());
            self.evictions += 1;
            trace!(key = %key, bytes = image.byte_size(), "Evicted from memory cache");
            evicted.push(image);
        }
    }
}

impl MemoryImageCache {
    /// Creates a cache holding at most `budget` decoded bytes.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size: 0,
                budget,
                evictions: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a cache whose budget is `fraction` of `baseline` bytes.
    ///
    /// # Errors
    /// Returns `InvalidFraction` unless `fraction` is within
    /// [`MIN_MEMORY_FRACTION`]..=[`MAX_MEMORY_FRACTION`].
    pub fn with_fraction(fraction: f32, baseline: u64) -> Result<Self, ConfigError> {
        let fraction = ConfigError::check_fraction(
            "memory cache",
            fraction,
            MIN_MEMORY_FRACTION,
            MAX_MEMORY_FRACTION,
        )?;
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let budget = (baseline as f64 * f64::from(fraction)) as usize;
        debug!(fraction, budget, "Created memory image cache");
        Ok(Self::new(budget))
    }

    /// Returns the byte budget.
    #[must_use]
    pub fn budget(&self) -> usize {
        self.inner.lock().budget
    }

    /// Returns the resident decoded bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Returns the number of cached images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the image for `key` and marks it most recently used.
    pub fn get(&self, key: &ImageKey) -> Option<Arc<CachedImage>> {
        let mut inner = self.inner.lock();
        if let Some(image) = inner.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Returns the image for `key` without touching the LRU order.
    pub fn peek(&self, key: &ImageKey) -> Option<Arc<CachedImage>> {
        self.inner.lock().entries.peek(key).cloned()
    }

    /// Inserts or replaces `key`, then evicts until within budget.
    ///
    /// An image larger than the whole budget is evicted straight away.
    pub fn put(&self, key: ImageKey, image: Arc<CachedImage>) {
        image.set_cached(true);
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.size += image.byte_size();
            if let Some(old) = inner.entries.put(key.clone(), image) {
                inner.size = inner.size.saturating_sub(old.byte_size());
                released.push(old);
            }
            inner.trim(&mut released);
        }
        debug!(key = %key, "Stored image in memory cache");
        for image in released {
            image.set_cached(false);
        }
    }

    /// Removes `key`, returning the image it held.
    pub fn remove(&self, key: &ImageKey) -> Option<Arc<CachedImage>> {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.entries.pop(key);
            if let Some(image) = &removed {
                inner.size = inner.size.saturating_sub(image.byte_size());
            }
            removed
        };
        if let Some(image) = &removed {
            image.set_cached(false);
            debug!(key = %key, "Removed image from memory cache");
        }
        removed
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.size = 0;
            let mut drained = Vec::with_capacity(inner.entries.len());
            while let Some((_, image)) = inner.entries.pop_lru() {
                drained.push(image);
            }
            drained
        };
        for image in &drained {
            image.set_cached(false);
        }
        debug!(count = drained.len(), "Cleared memory image cache");
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            count: inner.entries.len(),
            bytes: inner.size,
            budget: inner.budget,
            evictions: inner.evictions,
        }
    }
}

impl std::fmt::Debug for MemoryImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImageCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Statistics about memory cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub count: usize,
    /// Resident decoded bytes.
    pub bytes: usize,
    /// Byte budget.
    pub budget: usize,
    /// Entries evicted to stay within budget.
    pub evictions: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Memory cache: {} images, {}/{} bytes, {:.1}% hit rate ({} hits, {} misses, {} evictions)",
            self.count,
            self.bytes,
            self.budget,
            self.hit_rate,
            self.hits,
            self.misses,
            self.evictions
        )
    }
}
