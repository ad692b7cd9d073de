//! Decoded image shared between the memory cache and display targets.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::ImageKey;

/// A decoded image whose pixels are released once nothing references it.
///
/// Two independent owners are tracked: targets currently displaying the
/// image and the memory cache holding it. Pixels are dropped only when both
/// counts are zero and the image has been displayed at least once.
pub struct CachedImage {
    key: ImageKey,
    byte_size: usize,
    width: u32,
    height: u32,
    refs: Mutex<RefState>,
}

#[derive(Default)]
struct RefState {
    displayed: u32,
    cached: u32,
    has_been_displayed: bool,
    pixels: Option<Arc<image::DynamicImage>>,
}

impl CachedImage {
    /// Wraps a decoded image.
    #[must_use]
    pub fn new(key: ImageKey, image: image::DynamicImage) -> Self {
        Self::from_shared(key, Arc::new(image))
    }

    /// Wraps an already shared decoded image.
    #[must_use]
    pub fn from_shared(key: ImageKey, image: Arc<image::DynamicImage>) -> Self {
        Self {
            key,
            byte_size: image.as_bytes().len(),
            width: image.width(),
            height: image.height(),
            refs: Mutex::new(RefState {
                pixels: Some(image),
                ..RefState::default()
            }),
        }
    }

    /// Returns the cache key.
    #[must_use]
    pub const fn key(&self) -> &ImageKey {
        &self.key
    }

    /// Returns the decoded size in bytes, used for budget accounting.
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Returns the pixel dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns the pixels, or `None` once they have been released.
    #[must_use]
    pub fn image(&self) -> Option<Arc<image::DynamicImage>> {
        self.refs.lock().pixels.clone()
    }

    /// Returns true if the pixels have been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.refs.lock().pixels.is_none()
    }

    /// Records that a target started or stopped displaying this image.
    pub fn set_displayed(&self, displayed: bool) {
        let mut refs = self.refs.lock();
        if displayed {
            refs.displayed += 1;
            refs.has_been_displayed = true;
        } else {
            refs.displayed = refs.displayed.saturating_sub(1);
        }
        self.check_state(&mut refs);
    }

    /// Records that the memory cache started or stopped holding this image.
    pub fn set_cached(&self, cached: bool) {
        let mut refs = self.refs.lock();
        if cached {
            refs.cached += 1;
        } else {
            refs.cached = refs.cached.saturating_sub(1);
        }
        self.check_state(&mut refs);
    }

    /// Returns `(displayed, cached)` reference counts.
    #[must_use]
    pub fn ref_counts(&self) -> (u32, u32) {
        let refs = self.refs.lock();
        (refs.displayed, refs.cached)
    }

    fn check_state(&self, refs: &mut RefState) {
        if refs.displayed == 0
            && refs.cached == 0
            && refs.has_been_displayed
            && refs.pixels.take().is_some()
        {
            trace!(key = %self.key, bytes = self.byte_size, "Released image pixels");
        }
    }
}

impl std::fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (displayed, cached) = self.ref_counts();
        f.debug_struct("CachedImage")
            .field("key", &self.key)
            .field("byte_size", &self.byte_size)
            .field("displayed", &displayed)
            .field("cached", &cached)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CachedImage {
        CachedImage::new(ImageKey::new("k"), image::DynamicImage::new_rgba8(10, 10))
    }

    #[test]
    fn test_byte_size_matches_pixels() {
        let img = sample();
        assert_eq!(img.byte_size(), 10 * 10 * 4);
        assert_eq!(img.dimensions(), (10, 10));
    }

    #[test]
    fn test_release_after_display_and_uncache() {
        let img = sample();
        img.set_cached(true);
        img.set_displayed(true);
        img.set_displayed(false);
        assert!(!img.is_released(), "still cached");

        img.set_cached(false);
        assert!(img.is_released());
        assert!(img.image().is_none());
    }

    #[test]
    fn test_never_displayed_is_not_released() {
        let img = sample();
        img.set_cached(true);
        img.set_cached(false);
        assert!(!img.is_released());
        assert!(img.image().is_some());
    }

    #[test]
    fn test_counts_never_underflow() {
        let img = sample();
        img.set_displayed(false);
        img.set_cached(false);
        assert_eq!(img.ref_counts(), (0, 0));
    }
}
