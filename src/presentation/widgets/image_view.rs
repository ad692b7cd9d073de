//! Headless image view used as a load target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::domain::entities::{CachedImage, ImageKey};
use crate::domain::ports::{ImageTarget, Presentation, TargetBinding};

struct Transition {
    from: Option<Arc<CachedImage>>,
    started: Instant,
    duration: Duration,
}

#[derive(Default)]
struct ViewState {
    current: Option<Arc<CachedImage>>,
    transition: Option<Transition>,
    last: Option<Presentation>,
    assignments: usize,
}

/// A view that holds whatever image the loader last put on it.
#[derive(Default)]
pub struct ImageView {
    binding: TargetBinding,
    state: Mutex<ViewState>,
}

impl ImageView {
    /// Creates an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the displayed image.
    #[must_use]
    pub fn current_key(&self) -> Option<ImageKey> {
        self.state.lock().current.as_ref().map(|image| image.key().clone())
    }

    /// Number of times an image was put on this view.
    #[must_use]
    pub fn assignments(&self) -> usize {
        self.state.lock().assignments
    }

    /// Most recent presentation, kept until `clear`.
    #[must_use]
    pub fn last_presentation(&self) -> Option<Presentation> {
        self.state.lock().last.clone()
    }

    /// Fade progress in `0.0..=1.0`, or `None` when no fade is running.
    #[must_use]
    pub fn transition_progress(&self, now: Instant) -> Option<f32> {
        let state = self.state.lock();
        let transition = state.transition.as_ref()?;
        let elapsed = now.saturating_duration_since(transition.started);
        if elapsed >= transition.duration {
            return None;
        }
        Some(elapsed.as_secs_f32() / transition.duration.as_secs_f32())
    }

    /// Image being faded out, while a fade is running.
    #[must_use]
    pub fn fading_from(&self, now: Instant) -> Option<Arc<CachedImage>> {
        self.transition_progress(now)?;
        self.state
            .lock()
            .transition
            .as_ref()
            .and_then(|t| t.from.clone())
    }

    /// Removes the displayed image and returns it.
    pub fn clear(&self) -> Option<Arc<CachedImage>> {
        let mut state = self.state.lock();
        state.transition = None;
        state.last = None;
        let previous = state.current.take();
        drop(state);

        if let Some(image) = &previous {
            image.set_displayed(false);
        }
        previous
    }
}

impl ImageTarget for ImageView {
    fn binding(&self) -> &TargetBinding {
        &self.binding
    }

    fn current_image(&self) -> Option<Arc<CachedImage>> {
        self.state.lock().current.clone()
    }

    fn present(&self, presentation: Presentation) {
        let mut state = self.state.lock();
        state.transition = match &presentation {
            Presentation::Immediate(_) => None,
            Presentation::CrossFade { from, duration, .. } => Some(Transition {
                from: from.clone(),
                started: Instant::now(),
                duration: *duration,
            }),
        };
        state.current = Some(Arc::clone(presentation.image()));
        state.last = Some(presentation);
        state.assignments += 1;
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("binding", &self.binding)
            .field("current", &self.current_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(key: &str) -> Arc<CachedImage> {
        Arc::new(CachedImage::new(
            ImageKey::new(key),
            image::DynamicImage::new_rgba8(2, 2),
        ))
    }

    #[test]
    fn test_present_immediate() {
        let view = ImageView::new();
        view.present(Presentation::Immediate(cached("a")));

        assert_eq!(view.current_key(), Some(ImageKey::new("a")));
        assert_eq!(view.assignments(), 1);
        assert_eq!(view.transition_progress(Instant::now()), None);
    }

    #[test]
    fn test_cross_fade_progress() {
        let view = ImageView::new();
        let old = cached("old");
        view.present(Presentation::CrossFade {
            from: Some(old.clone()),
            to: cached("new"),
            duration: Duration::from_secs(10),
        });

        let now = Instant::now();
        let progress = view.transition_progress(now).unwrap();
        assert!((0.0..0.5).contains(&progress));
        assert_eq!(view.fading_from(now).map(|i| i.key().clone()), Some(ImageKey::new("old")));

        let later = now + Duration::from_secs(11);
        assert_eq!(view.transition_progress(later), None);
        assert!(view.fading_from(later).is_none());
    }

    #[test]
    fn test_clear_releases_display_reference() {
        let view = ImageView::new();
        let image = cached("a");
        image.set_displayed(true);
        view.present(Presentation::Immediate(image.clone()));

        let cleared = view.clear().unwrap();
        assert_eq!(cleared.key(), &ImageKey::new("a"));
        assert_eq!(image.ref_counts().0, 0);
        assert!(image.is_released());
        assert!(view.current_key().is_none());
    }
}
