//! Port definitions for turning request data into decoded images.

use std::path::PathBuf;

use crate::domain::entities::ImageKey;

/// Error type returned by image producers.
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single produce call. `Ok(None)` is treated as a load error.
pub type ProducerResult = Result<Option<image::DynamicImage>, ProducerError>;

/// Request payload accepted by the image loader.
pub trait ImageRequest: Clone + Send + Sync + 'static {
    /// Key under which the produced image is cached.
    fn cache_key(&self) -> ImageKey;
}

impl ImageRequest for String {
    fn cache_key(&self) -> ImageKey {
        ImageKey::new(self.as_str())
    }
}

impl ImageRequest for ImageKey {
    fn cache_key(&self) -> ImageKey {
        self.clone()
    }
}

impl ImageRequest for PathBuf {
    fn cache_key(&self) -> ImageKey {
        ImageKey::new(self.to_string_lossy())
    }
}

/// Produces a decoded image for a request.
///
/// Runs on a blocking worker thread; implementations may block, fail or
/// return `None`.
pub trait ImageProducer<D>: Send + Sync {
    /// Produces the image for `data`.
    ///
    /// # Errors
    /// Any error is reported to the request's listener and ends the load.
    fn produce(&self, data: &D) -> ProducerResult;
}

impl<D, F> ImageProducer<D> for F
where
    F: Fn(&D) -> ProducerResult + Send + Sync,
{
    fn produce(&self, data: &D) -> ProducerResult {
        self(data)
    }
}

/// Producer that decodes image files from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProducer;

impl ImageProducer<PathBuf> for FileProducer {
    fn produce(&self, data: &PathBuf) -> ProducerResult {
        Ok(Some(image::open(data)?))
    }
}
