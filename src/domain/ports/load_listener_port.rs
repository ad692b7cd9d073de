//! Port for observing load outcomes.

use std::sync::Arc;

use crate::domain::entities::{CachedImage, ImageSource};
use crate::domain::errors::LoadError;

use super::ImageTarget;

/// Callbacks fired on the main loop as a request progresses.
///
/// Every method has an empty default so listeners implement only what they
/// need. Cancelled requests fire nothing further.
pub trait LoadListener<D>: Send + Sync {
    /// The image is available, before it reaches the target.
    fn on_loaded(&self, _data: &D, _image: &Arc<CachedImage>, _source: ImageSource) {}

    /// The image is on the target and any transition has finished.
    fn on_displayed(&self, _data: &D, _image: &Arc<CachedImage>, _target: &Arc<dyn ImageTarget>) {}

    /// The request failed.
    fn on_error(&self, _data: &D, _error: &LoadError) {}
}
