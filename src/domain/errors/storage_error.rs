//! Storage cache error types.

use thiserror::Error;

/// Result type for storage cache operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while reading or writing the storage cache.
///
/// The load pipeline logs and swallows these; a failing storage tier
/// degrades to a cache miss.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// I/O error against the cache directory.
    #[error("IO error: {0}")]
    Io(String),
    /// Failed to encode an image for persistence.
    #[error("Encode error: {0}")]
    Encode(String),
    /// Failed to decode a persisted image.
    #[error("Decode error: {0}")]
    Decode(String),
}
