//! Infrastructure layer with executors, caches and configuration.

/// Application configuration.
pub mod config;
/// Worker pools and main-thread dispatch.
pub mod executors;
/// Image handling (caching, loading).
pub mod image;

pub use config::{AppConfig, CliArgs, ConfigStore, LogLevel};
pub use executors::{Executors, MainLoop, MainThread, PanicPolicy, PoolKind};
pub use self::image::{CacheStats, ImageLoader, LoadAction, MemoryImageCache, StorageImageCache};
