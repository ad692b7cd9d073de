//! Core image identifiers and load-state types.

use std::sync::atomic::{AtomicU8, Ordering};

/// Key under which an image is stored in both cache tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey(pub String);

impl ImageKey {
    /// Creates a new `ImageKey` from any string-like input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a filesystem-safe name derived from the key.
    ///
    /// Keys are arbitrary strings (URLs, paths), so the on-disk name is the
    /// first 16 bytes of their SHA-256, hex encoded.
    #[must_use]
    pub fn file_stem(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }
}

impl std::fmt::Display for ImageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImageKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ImageKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Where a loaded image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Served from the in-memory LRU cache.
    MemoryCache,
    /// Decoded from the on-disk cache.
    StorageCache,
    /// Freshly produced by the request's image producer.
    Producer,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::StorageCache => write!(f, "storage"),
            Self::Producer => write!(f, "producer"),
        }
    }
}

/// Execution state of a load action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    /// Created, not yet picked up by a worker.
    Idle = 0,
    /// A worker is running the action.
    Executing = 1,
    /// The action ran to completion (successfully or with an error).
    Finished = 2,
    /// The action was cancelled before it finished.
    Cancelled = 3,
}

impl LoadState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Executing,
            2 => Self::Finished,
            _ => Self::Cancelled,
        }
    }

    /// Returns true if the action can no longer change state on its own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// Lock-free cell holding a [`LoadState`].
#[derive(Debug)]
pub struct AtomicLoadState(AtomicU8);

impl AtomicLoadState {
    /// Creates a cell in the given state.
    #[must_use]
    pub const fn new(state: LoadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Reads the current state.
    #[must_use]
    pub fn load(&self) -> LoadState {
        LoadState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to` if the cell currently holds `from`.
    pub fn transition(&self, from: LoadState, to: LoadState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `to` from any non-terminal state.
    ///
    /// Returns false if the cell was already terminal.
    pub fn settle(&self, to: LoadState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if LoadState::from_u8(current).is_terminal() {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_is_stable_and_hex() {
        let key = ImageKey::new("https://example.com/image.png");
        let stem = key.file_stem();
        assert_eq!(stem.len(), 32);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(stem, ImageKey::new("https://example.com/image.png").file_stem());
        assert_ne!(stem, ImageKey::new("https://example.com/other.png").file_stem());
    }

    #[test]
    fn test_settle_keeps_first_terminal_state() {
        let state = AtomicLoadState::new(LoadState::Executing);
        assert!(state.settle(LoadState::Finished));
        assert!(!state.settle(LoadState::Cancelled));
        assert_eq!(state.load(), LoadState::Finished);
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let state = AtomicLoadState::new(LoadState::Idle);
        assert!(state.transition(LoadState::Idle, LoadState::Executing));
        assert!(!state.transition(LoadState::Idle, LoadState::Executing));
        assert_eq!(state.load(), LoadState::Executing);
    }
}
