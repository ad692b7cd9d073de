//! Port definitions for display targets and their action binding.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::domain::entities::{CachedImage, ImageKey};

/// Type-erased view of an in-flight load bound to a target.
pub trait ActionHandle: Send + Sync {
    /// Identity of the action, unique per loader.
    fn id(&self) -> u64;

    /// Key the action is loading.
    fn key(&self) -> &ImageKey;

    /// Cancels the action. Idempotent.
    fn cancel(&self);
}

/// Slot associating a target with the load action that currently owns it.
///
/// Only the bound action may write to the target; binding a new action
/// displaces the old one.
#[derive(Default)]
pub struct TargetBinding {
    action: Mutex<Option<Arc<dyn ActionHandle>>>,
}

impl TargetBinding {
    /// Creates an empty binding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `action`, returning whatever was bound before.
    pub fn bind(&self, action: Arc<dyn ActionHandle>) -> Option<Arc<dyn ActionHandle>> {
        self.action.lock().replace(action)
    }

    /// Removes and returns the bound action.
    pub fn take(&self) -> Option<Arc<dyn ActionHandle>> {
        self.action.lock().take()
    }

    /// Returns the bound action.
    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn ActionHandle>> {
        self.action.lock().clone()
    }

    /// Returns true if the action with `id` is the one bound.
    #[must_use]
    pub fn is_bound_to(&self, id: u64) -> bool {
        self.action.lock().as_ref().is_some_and(|a| a.id() == id)
    }

    /// Unbinds the action with `id`; leaves any other binding intact.
    pub fn release(&self, id: u64) -> bool {
        let mut slot = self.action.lock();
        if slot.as_ref().is_some_and(|a| a.id() == id) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for TargetBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound = self.action.lock().as_ref().map(|a| a.id());
        f.debug_struct("TargetBinding")
            .field("bound", &bound)
            .finish()
    }
}

/// How a new image should replace the target's content.
#[derive(Debug, Clone)]
pub enum Presentation {
    /// Replace the content at once.
    Immediate(Arc<CachedImage>),
    /// Composite `to` over `from` for `duration`.
    CrossFade {
        /// Content shown before the load completed.
        from: Option<Arc<CachedImage>>,
        /// Newly loaded image.
        to: Arc<CachedImage>,
        /// Length of the transition.
        duration: Duration,
    },
}

impl Presentation {
    /// Returns the image that ends up displayed.
    #[must_use]
    pub fn image(&self) -> &Arc<CachedImage> {
        match self {
            Self::Immediate(image) | Self::CrossFade { to: image, .. } => image,
        }
    }
}

/// A display surface the loader writes images into.
///
/// All methods except `binding` are only called from the main loop.
pub trait ImageTarget: Send + Sync + 'static {
    /// Binding slot for the action that owns this target.
    fn binding(&self) -> &TargetBinding;

    /// Image currently displayed, if any.
    fn current_image(&self) -> Option<Arc<CachedImage>>;

    /// Replaces the displayed content.
    fn present(&self, presentation: Presentation);
}


#[cfg(test)]
mod tests {
    use super::mock::StubAction;
    use super::*;

    #[test]
    fn test_bind_returns_previous() {
        let binding = TargetBinding::new();
        assert!(binding.bind(StubAction::new(1, "a")).is_none());

        let previous = binding.bind(StubAction::new(2, "b"));
        assert_eq!(previous.map(|a| a.id()), Some(1));
        assert!(binding.is_bound_to(2));
        assert!(!binding.is_bound_to(1));
    }

    #[test]
    fn test_release_only_matching_id() {
        let binding = TargetBinding::new();
        binding.bind(StubAction::new(7, "a"));

        assert!(!binding.release(8));
        assert!(binding.is_bound_to(7));
        assert!(binding.release(7));
        assert!(binding.current().is_none());
    }
}
