//! A single request to resolve an image and put it on a target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::domain::entities::{AtomicLoadState, CachedImage, ImageKey, ImageSource, LoadState};
use crate::domain::errors::LoadError;
use crate::domain::ports::{
    ActionHandle, ImageProducer, ImageRequest, ImageTarget, LoadListener, Presentation,
};
use crate::infrastructure::executors::{MainThread, WorkerPool, panic_message};

use super::memory_cache::MemoryImageCache;
use super::storage_cache::StorageImageCache;

/// Process-wide switches shared by every action of a loader.
#[derive(Debug, Default)]
pub struct LoadControl {
    paused: AtomicBool,
    exit_early: AtomicBool,
    wake: Notify,
}

impl LoadControl {
    /// Makes workers wait before starting new work.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        debug!("Image loading paused");
    }

    /// Lets waiting workers continue.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake.notify_waiters();
        debug!("Image loading resumed");
    }

    /// Returns true while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Makes every in-flight and future action give up. Cannot be undone.
    pub fn exit_early(&self) {
        if !self.exit_early.swap(true, Ordering::AcqRel) {
            debug!("Image loading exiting early");
        }
        self.wake.notify_waiters();
    }

    /// Returns true once `exit_early` has been called.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.exit_early.load(Ordering::Acquire)
    }

    fn wake_all(&self) {
        self.wake.notify_waiters();
    }

    /// Waits while paused, unless exiting or `cancelled` says otherwise.
    /// The condition is re-checked on every wake.
    async fn wait_while_paused(&self, cancelled: impl Fn() -> bool) {
        loop {
            let notified = self.wake.notified();
            if !self.is_paused() || self.is_exiting() || cancelled() {
                return;
            }
            trace!("Load waiting for resume");
            notified.await;
        }
    }
}

/// Everything an action needs while it runs.
pub(crate) struct LoadContext<D> {
    pub(crate) memory: Arc<MemoryImageCache>,
    pub(crate) storage: Option<Arc<StorageImageCache>>,
    pub(crate) producer: Arc<dyn ImageProducer<D>>,
    pub(crate) control: Arc<LoadControl>,
    pub(crate) main: MainThread,
    pub(crate) fade: Option<Duration>,
}

/// One in-flight request for `data`, bound to a target it does not own.
pub struct LoadAction<D: ImageRequest> {
    id: u64,
    data: D,
    key: ImageKey,
    target: Weak<dyn ImageTarget>,
    listener: Option<Arc<dyn LoadListener<D>>>,
    state: AtomicLoadState,
    cancelled: AtomicBool,
    control: Arc<LoadControl>,
    job: Mutex<Option<JoinHandle<Option<()>>>>,
}

impl<D: ImageRequest> LoadAction<D> {
    pub(crate) fn new(
        id: u64,
        data: D,
        target: &Arc<dyn ImageTarget>,
        listener: Option<Arc<dyn LoadListener<D>>>,
        control: Arc<LoadControl>,
    ) -> Arc<Self> {
        let key = data.cache_key();
        Arc::new(Self {
            id,
            data,
            key,
            target: Arc::downgrade(target),
            listener,
            state: AtomicLoadState::new(LoadState::Idle),
            cancelled: AtomicBool::new(false),
            control,
            job: Mutex::new(None),
        })
    }

    /// Returns the action's identity.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the request data.
    #[must_use]
    pub const fn data(&self) -> &D {
        &self.data
    }

    /// Returns the cache key.
    #[must_use]
    pub const fn key(&self) -> &ImageKey {
        &self.key
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LoadState {
        self.state.load()
    }

    /// Returns true once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the action.
    ///
    /// Idempotent and valid in any state. A finished action stays
    /// finished. Work already inside the producer or a file write runs to
    /// completion and its result is dropped.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state.settle(LoadState::Cancelled) {
            debug!(id = self.id, key = %self.key, "Cancelled image load");
        }
        self.control.wake_all();
    }

    /// Returns a finished or cancelled action to `Idle` so it can run again.
    ///
    /// Returns false if the action is idle or executing.
    pub fn reset(&self) -> bool {
        let state = self.state.load();
        if !state.is_terminal() || !self.state.transition(state, LoadState::Idle) {
            return false;
        }
        self.cancelled.store(false, Ordering::Release);
        true
    }

    /// Waits for the background job, if one was started.
    pub async fn join(&self) {
        let handle = self.job.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(id = self.id, error = %e, "Load task failed");
        }
    }

    pub(crate) fn start(self: &Arc<Self>, pool: &WorkerPool, ctx: Arc<LoadContext<D>>) {
        let action = Arc::clone(self);
        let handle = pool.spawn(async move { action.execute(ctx).await });
        *self.job.lock() = Some(handle);
    }

    /// Idle to executing; fails if cancelled or already started.
    fn begin(&self) -> bool {
        !self.is_cancelled() && self.state.transition(LoadState::Idle, LoadState::Executing)
    }

    /// Checks for cancellation or exit and settles the state if so.
    fn abandoned(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        if self.control.is_exiting() {
            self.state.settle(LoadState::Cancelled);
            return true;
        }
        false
    }

    fn finish(&self) {
        self.state.transition(LoadState::Executing, LoadState::Finished);
    }

    async fn execute(self: Arc<Self>, ctx: Arc<LoadContext<D>>) {
        if !self.begin() {
            trace!(id = self.id, state = ?self.state(), "Skipping load that cannot start");
            return;
        }

        ctx.control.wait_while_paused(|| self.is_cancelled()).await;
        if self.abandoned() {
            return;
        }

        let stored = match &ctx.storage {
            Some(storage) => storage.get(&self.key).await,
            None => None,
        };
        if self.abandoned() {
            return;
        }

        let (image, source) = if let Some(image) = stored {
            (Arc::new(image), ImageSource::StorageCache)
        } else {
            match self.produce(&ctx).await {
                Ok(image) => (Arc::new(image), ImageSource::Producer),
                Err(error) => {
                    self.fail(&ctx, error);
                    return;
                }
            }
        };
        if self.abandoned() {
            return;
        }

        let cached = Arc::new(CachedImage::from_shared(self.key.clone(), image.clone()));
        self.notify_loaded(&ctx, &cached, source);

        if source == ImageSource::Producer
            && let Some(storage) = &ctx.storage
            && let Err(e) = storage.put(&self.key, image).await
        {
            warn!(key = %self.key, error = %e, "Failed to write storage cache");
        }

        ctx.memory.put(self.key.clone(), cached.clone());
        if self.abandoned() {
            return;
        }

        let action = Arc::clone(&self);
        let apply_ctx = Arc::clone(&ctx);
        ctx.main.post(move || action.apply(cached, &apply_ctx));
        self.finish();
        debug!(id = self.id, key = %self.key, %source, "Image loaded");
    }

    async fn produce(&self, ctx: &LoadContext<D>) -> Result<image::DynamicImage, LoadError> {
        let producer = Arc::clone(&ctx.producer);
        let data = self.data.clone();
        match tokio::task::spawn_blocking(move || producer.produce(&data)).await {
            Ok(Ok(Some(image))) => Ok(image),
            Ok(Ok(None)) => Err(LoadError::EmptyResult),
            Ok(Err(e)) => Err(LoadError::producer(e)),
            Err(e) if e.is_panic() => Err(LoadError::Panicked(
                panic_message(e.into_panic().as_ref()).to_owned(),
            )),
            Err(e) => Err(LoadError::producer(e)),
        }
    }

    fn notify_loaded(
        self: &Arc<Self>,
        ctx: &LoadContext<D>,
        image: &Arc<CachedImage>,
        source: ImageSource,
    ) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let action = Arc::clone(self);
        let image = Arc::clone(image);
        ctx.main.post(move || {
            if action.is_superseded() {
                return;
            }
            listener.on_loaded(&action.data, &image, source);
        });
    }

    fn fail(self: &Arc<Self>, ctx: &LoadContext<D>, error: LoadError) {
        if self.abandoned() {
            return;
        }
        debug!(id = self.id, key = %self.key, error = %error, "Image load failed");
        self.finish();
        if let Some(listener) = self.listener.clone() {
            let action = Arc::clone(self);
            ctx.main.post(move || {
                if action.is_superseded() {
                    trace!(id = action.id, "Dropping error of abandoned load");
                    return;
                }
                listener.on_error(&action.data, &error);
            });
        }
    }

    /// Checked again on the main loop, after the job was posted.
    fn is_superseded(&self) -> bool {
        self.is_cancelled() || self.control.is_exiting()
    }

    /// Main-loop step: show the image if this action still owns the target.
    fn apply(&self, image: Arc<CachedImage>, ctx: &LoadContext<D>) {
        if self.is_superseded() {
            trace!(id = self.id, "Dropping result of abandoned load");
            return;
        }
        let Some(target) = self.target.upgrade() else {
            trace!(id = self.id, "Target gone, dropping result");
            return;
        };
        if !target.binding().release(self.id) {
            trace!(id = self.id, "Target rebound, dropping result");
            return;
        }
        present(
            &target,
            image,
            self.data.clone(),
            self.listener.clone(),
            ctx.fade,
            &ctx.main,
        );
    }
}

impl<D: ImageRequest> ActionHandle for LoadAction<D> {
    fn id(&self) -> u64 {
        self.id
    }

    fn key(&self) -> &ImageKey {
        &self.key
    }

    fn cancel(&self) {
        Self::cancel(self);
    }
}

impl<D: ImageRequest> std::fmt::Debug for LoadAction<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadAction")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Puts `image` on `target`, updating display counts, and fires
/// `on_displayed` once any fade has finished. Main loop only.
pub(crate) fn present<D: ImageRequest>(
    target: &Arc<dyn ImageTarget>,
    image: Arc<CachedImage>,
    data: D,
    listener: Option<Arc<dyn LoadListener<D>>>,
    fade: Option<Duration>,
    main: &MainThread,
) {
    image.set_displayed(true);
    let previous = target.current_image();

    match fade {
        Some(duration) if !duration.is_zero() => {
            target.present(Presentation::CrossFade {
                from: previous.clone(),
                to: Arc::clone(&image),
                duration,
            });
            let target = Arc::clone(target);
            main.post_delayed(duration, move || {
                if let Some(previous) = previous {
                    previous.set_displayed(false);
                }
                let still_shown = target
                    .current_image()
                    .is_some_and(|current| Arc::ptr_eq(&current, &image));
                if !still_shown {
                    trace!(key = %image.key(), "Fade finished on a replaced image");
                    return;
                }
                if let Some(listener) = listener {
                    listener.on_displayed(&data, &image, &target);
                }
            });
        }
        _ => {
            target.present(Presentation::Immediate(Arc::clone(&image)));
            if let Some(previous) = previous {
                previous.set_displayed(false);
            }
            if let Some(listener) = listener {
                listener.on_displayed(&data, &image, target);
            }
        }
    }
}
