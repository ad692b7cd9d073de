//! Application configuration.

pub mod app_config;
pub mod args;
pub mod store;

pub use app_config::{AppConfig, CacheConfig, DisplayConfig, LogLevel, PoolConfig};
pub use args::CliArgs;
pub use store::ConfigStore;
