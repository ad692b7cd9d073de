//! Errors reported to load listeners.

use thiserror::Error;

/// Terminal failure of a single load request.
///
/// Load errors are never retried; they reach the caller only through
/// `LoadListener::on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The image producer returned an error.
    #[error("image producer failed: {0}")]
    Producer(String),
    /// The image producer returned no image.
    #[error("image producer returned no image")]
    EmptyResult,
    /// The image producer panicked.
    #[error("image producer panicked: {0}")]
    Panicked(String),
}

impl LoadError {
    /// Creates a producer error from any displayable error.
    #[must_use]
    pub fn producer(error: impl std::fmt::Display) -> Self {
        Self::Producer(error.to_string())
    }
}
