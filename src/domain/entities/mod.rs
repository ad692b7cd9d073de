//! Domain entity definitions.

mod cached_image;
mod image;

pub use cached_image::CachedImage;
pub use self::image::{AtomicLoadState, ImageKey, ImageSource, LoadState};
