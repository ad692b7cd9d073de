//! Domain error types.

mod config_error;
mod load_error;
mod storage_error;

pub use config_error::ConfigError;
pub use load_error::LoadError;
pub use storage_error::{StorageError, StorageResult};
