//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction by decoded size
//! - Storage caching on disk with single-flight trimming
//! - Load actions and the loader that schedules them

pub mod load_action;
pub mod loader;
pub mod memory_cache;
pub mod storage_cache;

pub use load_action::{LoadAction, LoadControl};
pub use loader::ImageLoader;
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use storage_cache::{
    FitReport, OpenError, StorageFormat, StorageImageCache, StorageOptions,
};
