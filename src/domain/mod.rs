//! Domain layer with core entities, errors and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CachedImage, ImageKey, ImageSource, LoadState};
pub use errors::{ConfigError, LoadError, StorageError};
pub use ports::{ImageProducer, ImageRequest, ImageTarget, LoadListener, TargetBinding};
