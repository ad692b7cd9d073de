//! Async image loading orchestrator.
//!
//! Resolves a request through three tiers: memory, then storage, then the
//! producer. Each target is owned by at most one in-flight action; a newer
//! request for the same target cancels the older one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::domain::entities::ImageSource;
use crate::domain::ports::{ImageProducer, ImageRequest, ImageTarget, LoadListener};
use crate::infrastructure::config::{CacheConfig, DisplayConfig};
use crate::infrastructure::executors::Executors;

use super::load_action::{LoadAction, LoadContext, LoadControl, present};
use super::memory_cache::MemoryImageCache;
use super::storage_cache::{OpenError, StorageImageCache, StorageOptions};

/// Loads images for request data of type `D` onto image targets.
pub struct ImageLoader<D: ImageRequest> {
    ctx: Arc<LoadContext<D>>,
    executors: Arc<Executors>,
    next_id: AtomicU64,
}

impl<D: ImageRequest> std::fmt::Debug for ImageLoader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("memory", &self.ctx.memory)
            .field("storage", &self.ctx.storage)
            .field("fade", &self.ctx.fade)
            .finish_non_exhaustive()
    }
}

impl<D: ImageRequest> ImageLoader<D> {
    /// Creates a loader over existing caches.
    ///
    /// `fade` enables cross-fading for images that were not in memory.
    #[must_use]
    pub fn new(
        executors: Arc<Executors>,
        memory: Arc<MemoryImageCache>,
        storage: Option<Arc<StorageImageCache>>,
        producer: Arc<dyn ImageProducer<D>>,
        fade: Option<Duration>,
    ) -> Self {
        let ctx = LoadContext {
            memory,
            storage,
            producer,
            control: Arc::new(LoadControl::default()),
            main: executors.main().clone(),
            fade,
        };
        Self {
            ctx: Arc::new(ctx),
            executors,
            next_id: AtomicU64::new(1),
        }
    }

    /// Builds both caches from configuration.
    ///
    /// # Errors
    /// Returns an error if the budgets are invalid or the storage directory
    /// cannot be created.
    pub async fn from_config(
        cache: &CacheConfig,
        display: &DisplayConfig,
        executors: Arc<Executors>,
        producer: Arc<dyn ImageProducer<D>>,
    ) -> Result<Self, OpenError> {
        cache.validate()?;
        let memory = Arc::new(MemoryImageCache::with_fraction(
            cache.memory_fraction,
            cache.effective_memory_baseline(),
        )?);

        let storage = match (cache.storage_enabled, cache.effective_storage_dir()) {
            (true, Some(dir)) => {
                let options = StorageOptions::new(dir)
                    .with_max_size(cache.storage_max_bytes)
                    .with_format(cache.storage_format);
                let storage =
                    StorageImageCache::open(options, Arc::clone(executors.storage())).await?;
                Some(Arc::new(storage))
            }
            (true, None) => {
                warn!("No cache directory available, storage cache disabled");
                None
            }
            (false, _) => None,
        };

        info!(
            memory_budget = memory.budget(),
            storage = storage.is_some(),
            "Image loader ready"
        );
        Ok(Self::new(executors, memory, storage, producer, display.fade()))
    }

    /// Requests `data` for `target`.
    ///
    /// Cancels whatever action currently owns `target`. A memory hit is
    /// shown immediately and returns `None`; otherwise the returned action
    /// runs on the image pool and applies its result on the main loop.
    /// Must be called from the main loop.
    pub fn load(
        &self,
        data: D,
        target: &Arc<dyn ImageTarget>,
        listener: Option<Arc<dyn LoadListener<D>>>,
    ) -> Option<Arc<LoadAction<D>>> {
        let key = data.cache_key();

        if let Some(previous) = target.binding().take() {
            debug!(id = previous.id(), key = %previous.key(), "Superseding load");
            previous.cancel();
        }

        if self.ctx.control.is_exiting() {
            trace!(key = %key, "Loader exiting, ignoring request");
            return None;
        }

        if let Some(image) = self.ctx.memory.get(&key) {
            trace!(key = %key, "Memory cache hit");
            if let Some(listener) = &listener {
                listener.on_loaded(&data, &image, ImageSource::MemoryCache);
            }
            present(target, image, data, listener, None, &self.ctx.main);
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let action = LoadAction::new(id, data, target, listener, Arc::clone(&self.ctx.control));
        target.binding().bind(action.clone());
        action.start(self.executors.image(), Arc::clone(&self.ctx));
        trace!(id, key = %key, "Load scheduled");
        Some(action)
    }

    /// Cancels and unbinds the action that owns `target`.
    ///
    /// Returns false if nothing was bound.
    pub fn cancel(&self, target: &Arc<dyn ImageTarget>) -> bool {
        target.binding().take().is_some_and(|action| {
            action.cancel();
            true
        })
    }

    /// Makes workers wait before starting new work.
    pub fn pause(&self) {
        self.ctx.control.pause();
    }

    /// Lets paused workers continue.
    pub fn resume(&self) {
        self.ctx.control.resume();
    }

    /// Returns true while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.ctx.control.is_paused()
    }

    /// Abandons all in-flight and future loads. Cannot be undone.
    pub fn exit_tasks_early(&self) {
        self.ctx.control.exit_early();
    }

    /// Returns true once loading has been abandoned.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.ctx.control.is_exiting()
    }

    /// Returns the memory cache.
    #[must_use]
    pub fn memory_cache(&self) -> &Arc<MemoryImageCache> {
        &self.ctx.memory
    }

    /// Returns the storage cache, if enabled.
    #[must_use]
    pub fn storage_cache(&self) -> Option<&Arc<StorageImageCache>> {
        self.ctx.storage.as_ref()
    }

    /// Returns the executors this loader schedules on.
    #[must_use]
    pub const fn executors(&self) -> &Arc<Executors> {
        &self.executors
    }

    /// Drops every image held by the memory cache.
    pub fn clear_memory_cache(&self) {
        self.ctx.memory.clear();
        debug!("Memory image cache cleared");
    }

    /// Drops every cached image in memory and on disk.
    pub async fn clear_caches(&self) {
        self.clear_memory_cache();
        if let Some(storage) = &self.ctx.storage
            && let Err(e) = storage.clear().await
        {
            warn!(error = %e, "Failed to clear storage cache");
        }
    }
}

impl<D: ImageRequest> Drop for ImageLoader<D> {
    fn drop(&mut self) {
        self.ctx.control.exit_early();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{CachedImage, ImageKey, LoadState};
    use crate::domain::errors::LoadError;
    use crate::domain::ports::mocks::{ListenerEvent, RecordingListener};
    use crate::domain::ports::{Presentation, ProducerResult};
    use crate::infrastructure::config::PoolConfig;
    use crate::infrastructure::executors::MainLoop;
    use crate::presentation::widgets::ImageView;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        loader: ImageLoader<String>,
        main_loop: MainLoop,
        calls: Arc<AtomicUsize>,
    }

    /// Producer that returns a 4x4 image, sleeping for keys prefixed `slow`.
    fn counting_producer(calls: Arc<AtomicUsize>) -> Arc<dyn ImageProducer<String>> {
        Arc::new(move |data: &String| -> ProducerResult {
            calls.fetch_add(1, Ordering::SeqCst);
            if data.starts_with("slow") {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(Some(image::DynamicImage::new_rgba8(4, 4)))
        })
    }

    fn fixture_with(
        producer: Option<Arc<dyn ImageProducer<String>>>,
        storage: Option<Arc<StorageImageCache>>,
        fade: Option<Duration>,
        existing: Option<(Arc<Executors>, MainLoop)>,
    ) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let producer = producer.unwrap_or_else(|| counting_producer(calls.clone()));
        let (executors, main_loop) = existing
            .unwrap_or_else(|| Executors::from_current(&PoolConfig::default()).unwrap());
        let memory = Arc::new(MemoryImageCache::new(1024 * 1024));
        Fixture {
            loader: ImageLoader::new(executors, memory, storage, producer, fade),
            main_loop,
            calls,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None, None, None, None)
    }

    fn view() -> (Arc<ImageView>, Arc<dyn ImageTarget>) {
        let view = Arc::new(ImageView::new());
        let target: Arc<dyn ImageTarget> = view.clone();
        (view, target)
    }

    fn listener_of(recorder: &Arc<RecordingListener>) -> Option<Arc<dyn LoadListener<String>>> {
        let listener: Arc<dyn LoadListener<String>> = recorder.clone();
        Some(listener)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_reaches_target() {
        let mut fx = fixture();
        let (view, target) = view();
        let recorder = RecordingListener::new();

        let action = fx
            .loader
            .load("k1".to_string(), &target, listener_of(&recorder))
            .expect("memory miss schedules an action");
        assert!(fx.main_loop.run_until(WAIT, || !recorder.displayed().is_empty()).await);

        assert_eq!(action.state(), LoadState::Finished);
        assert_eq!(view.current_key(), Some(ImageKey::new("k1")));
        assert!(target.binding().current().is_none());
        assert_eq!(
            recorder.events(),
            vec![
                ListenerEvent::Loaded("k1".to_string(), ImageSource::Producer),
                ListenerEvent::Displayed("k1".to_string()),
            ]
        );
        assert!(fx.loader.memory_cache().peek(&ImageKey::new("k1")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_newer_request_supersedes_older() {
        let mut fx = fixture();
        let (view, target) = view();
        let recorder = RecordingListener::new();

        let first = fx
            .loader
            .load("slow-k1".to_string(), &target, listener_of(&recorder))
            .unwrap();
        let second = fx
            .loader
            .load("k2".to_string(), &target, listener_of(&recorder))
            .unwrap();

        assert!(first.is_cancelled());
        assert!(target.binding().is_bound_to(second.id()));

        assert!(fx.main_loop.run_until(WAIT, || !recorder.displayed().is_empty()).await);
        first.join().await;
        fx.main_loop.run_pending();

        assert_eq!(first.state(), LoadState::Cancelled);
        assert_eq!(view.current_key(), Some(ImageKey::new("k2")));
        assert_eq!(view.assignments(), 1);
        assert_eq!(recorder.displayed(), vec!["k2".to_string()]);
        assert!(!recorder.has_errors());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_memory_hit_shows_synchronously() {
        let fx = fixture();
        let (view, target) = view();
        let recorder = RecordingListener::new();
        let key = ImageKey::new("cached");
        fx.loader.memory_cache().put(
            key.clone(),
            Arc::new(CachedImage::new(key.clone(), image::DynamicImage::new_rgba8(2, 2))),
        );

        let action = fx
            .loader
            .load("cached".to_string(), &target, listener_of(&recorder));

        assert!(action.is_none());
        assert_eq!(view.current_key(), Some(key));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            recorder.events(),
            vec![
                ListenerEvent::Loaded("cached".to_string(), ImageSource::MemoryCache),
                ListenerEvent::Displayed("cached".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_memory_hit_cancels_pending_action() {
        let mut fx = fixture();
        let (view, target) = view();
        let key = ImageKey::new("cached");
        fx.loader.memory_cache().put(
            key.clone(),
            Arc::new(CachedImage::new(key.clone(), image::DynamicImage::new_rgba8(2, 2))),
        );

        let slow = fx.loader.load("slow".to_string(), &target, None).unwrap();
        assert!(fx.loader.load("cached".to_string(), &target, None).is_none());
        slow.join().await;
        fx.main_loop.run_pending();

        assert!(slow.is_cancelled());
        assert_eq!(view.current_key(), Some(key));
        assert_eq!(view.assignments(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_storage_hit_skips_producer() {
        let dir = TempDir::new().unwrap();
        let (executors, main_loop) = Executors::from_current(&PoolConfig::default()).unwrap();
        let storage = Arc::new(
            StorageImageCache::open(
                StorageOptions::new(dir.path()),
                Arc::clone(executors.storage()),
            )
            .await
            .unwrap(),
        );
        let mut fx = fixture_with(None, Some(storage.clone()), None, Some((executors, main_loop)));

        let (_, first_target) = view();
        let action = fx.loader.load("k".to_string(), &first_target, None).unwrap();
        action.join().await;
        assert!(storage.contains(&ImageKey::new("k")).await);

        fx.loader.clear_memory_cache();
        let (view, target) = view();
        let recorder = RecordingListener::new();
        fx.loader
            .load("k".to_string(), &target, listener_of(&recorder))
            .unwrap();
        assert!(fx.main_loop.run_until(WAIT, || !recorder.displayed().is_empty()).await);

        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(view.current_key(), Some(ImageKey::new("k")));
        assert_eq!(
            recorder.events()[0],
            ListenerEvent::Loaded("k".to_string(), ImageSource::StorageCache)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_producer_failures_reported() {
        let producer: Arc<dyn ImageProducer<String>> =
            Arc::new(|data: &String| -> ProducerResult {
                match data.as_str() {
                    "empty" => Ok(None),
                    "panic" => panic!("decoder exploded"),
                    _ => Err("no such file".into()),
                }
            });
        let mut fx = fixture_with(Some(producer), None, None, None);
        let recorder = RecordingListener::new();

        let mut views = Vec::new();
        for data in ["missing", "empty", "panic"] {
            let (view, target) = view();
            fx.loader
                .load(data.to_string(), &target, listener_of(&recorder))
                .unwrap();
            views.push(view);
        }
        assert!(
            fx.main_loop
                .run_until(WAIT, || recorder.events().len() == 3)
                .await
        );

        let events = recorder.events();
        assert!(events.contains(&ListenerEvent::Error(
            "missing".to_string(),
            LoadError::Producer("no such file".to_string())
        )));
        assert!(events.contains(&ListenerEvent::Error(
            "empty".to_string(),
            LoadError::EmptyResult
        )));
        assert!(events.contains(&ListenerEvent::Error(
            "panic".to_string(),
            LoadError::Panicked("decoder exploded".to_string())
        )));
        assert!(views.iter().all(|v| v.current_key().is_none()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_holds_work_until_resume() {
        let mut fx = fixture();
        let (view, target) = view();
        let recorder = RecordingListener::new();

        fx.loader.pause();
        assert!(fx.loader.is_paused());
        let action = fx
            .loader
            .load("k".to_string(), &target, listener_of(&recorder))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(action.state(), LoadState::Executing);

        fx.loader.resume();
        assert!(fx.main_loop.run_until(WAIT, || !recorder.displayed().is_empty()).await);
        assert_eq!(view.current_key(), Some(ImageKey::new("k")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_wakes_paused_action() {
        let fx = fixture();
        let (_, target) = view();

        fx.loader.pause();
        let action = fx.loader.load("k".to_string(), &target, None).unwrap();
        assert!(fx.loader.cancel(&target));
        assert!(!fx.loader.cancel(&target));

        assert!(tokio::time::timeout(WAIT, action.join()).await.is_ok());
        assert_eq!(action.state(), LoadState::Cancelled);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exit_early_abandons_work() {
        let mut fx = fixture();
        let (view, target) = view();
        let recorder = RecordingListener::new();

        fx.loader.pause();
        let action = fx
            .loader
            .load("k".to_string(), &target, listener_of(&recorder))
            .unwrap();
        fx.loader.exit_tasks_early();

        assert!(tokio::time::timeout(WAIT, action.join()).await.is_ok());
        fx.main_loop.run_pending();
        assert_eq!(action.state(), LoadState::Cancelled);
        assert!(view.current_key().is_none());
        assert!(recorder.events().is_empty());

        assert!(fx.loader.load("k2".to_string(), &target, None).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_target_is_skipped() {
        let mut fx = fixture();
        let recorder = RecordingListener::new();
        let action = {
            let (_, target) = view();
            fx.loader
                .load("k".to_string(), &target, listener_of(&recorder))
                .unwrap()
        };

        action.join().await;
        fx.main_loop.run_pending();
        assert_eq!(action.state(), LoadState::Finished);
        assert!(recorder.displayed().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cross_fade_defers_displayed() {
        let fade = Duration::from_millis(30);
        let mut fx = fixture_with(None, None, Some(fade), None);
        let (view, target) = view();
        let recorder = RecordingListener::new();

        let action = fx
            .loader
            .load("k".to_string(), &target, listener_of(&recorder))
            .unwrap();
        action.join().await;
        assert!(fx.main_loop.run_until(WAIT, || view.current_key().is_some()).await);

        assert!(matches!(
            view.last_presentation(),
            Some(Presentation::CrossFade { from: None, duration, .. }) if duration == fade
        ));
        assert!(recorder.displayed().is_empty());

        assert!(fx.main_loop.run_until(WAIT, || !recorder.displayed().is_empty()).await);
        assert_eq!(recorder.displayed(), vec!["k".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replaced_image_is_undisplayed() {
        let mut fx = fixture();
        let (view, target) = view();

        fx.loader.load("a".to_string(), &target, None).unwrap();
        assert!(fx.main_loop.run_until(WAIT, || view.current_key().is_some()).await);
        let first = view.current_image().unwrap();
        assert_eq!(first.ref_counts(), (1, 1));

        fx.loader.load("b".to_string(), &target, None).unwrap();
        assert!(
            fx.main_loop
                .run_until(WAIT, || view.current_key() == Some(ImageKey::new("b")))
                .await
        );
        assert_eq!(first.ref_counts(), (0, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fade_of_replaced_image_is_not_displayed() {
        let fade = Duration::from_millis(100);
        let mut fx = fixture_with(None, None, Some(fade), None);
        let (view, target) = view();
        let recorder = RecordingListener::new();

        let action = fx
            .loader
            .load("a".to_string(), &target, listener_of(&recorder))
            .unwrap();
        action.join().await;
        fx.main_loop.run_pending();
        assert_eq!(view.current_key(), Some(ImageKey::new("a")));

        let key = ImageKey::new("b");
        fx.loader.memory_cache().put(
            key.clone(),
            Arc::new(CachedImage::new(key.clone(), image::DynamicImage::new_rgba8(2, 2))),
        );
        assert!(
            fx.loader
                .load("b".to_string(), &target, listener_of(&recorder))
                .is_none()
        );

        assert!(!fx.main_loop.run_until(fade * 3, || false).await);
        assert_eq!(view.current_key(), Some(key));
        assert_eq!(recorder.displayed(), vec!["b".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_of_superseded_load_is_dropped() {
        let producer: Arc<dyn ImageProducer<String>> =
            Arc::new(|data: &String| -> ProducerResult {
                if data == "k1" {
                    return Err("unreadable".into());
                }
                Ok(Some(image::DynamicImage::new_rgba8(4, 4)))
            });
        let mut fx = fixture_with(Some(producer), None, None, None);
        let (view, target) = view();
        let recorder = RecordingListener::new();

        let first = fx
            .loader
            .load("k1".to_string(), &target, listener_of(&recorder))
            .unwrap();
        first.join().await;
        assert_eq!(first.state(), LoadState::Finished);

        fx.loader
            .load("k2".to_string(), &target, listener_of(&recorder))
            .unwrap();
        assert!(first.is_cancelled());
        assert!(fx.main_loop.run_until(WAIT, || !recorder.displayed().is_empty()).await);

        assert!(!recorder.has_errors());
        assert_eq!(view.current_key(), Some(ImageKey::new("k2")));
        assert_eq!(
            recorder.events(),
            vec![
                ListenerEvent::Loaded("k2".to_string(), ImageSource::Producer),
                ListenerEvent::Displayed("k2".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_from_config_builds_storage() {
        let dir = TempDir::new().unwrap();
        let (executors, _main_loop) = Executors::from_current(&PoolConfig::default()).unwrap();
        let cache = CacheConfig {
            memory_baseline_bytes: Some(256 * 1024 * 1024),
            storage_dir: Some(dir.path().join("images")),
            ..CacheConfig::default()
        };

        let loader: ImageLoader<String> = ImageLoader::from_config(
            &cache,
            &DisplayConfig::default(),
            executors,
            counting_producer(Arc::new(AtomicUsize::new(0))),
        )
        .await
        .unwrap();

        assert!(loader.storage_cache().is_some());
        assert!(dir.path().join("images").is_dir());
        assert_eq!(loader.memory_cache().budget(), 64 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_fraction() {
        let (executors, _main_loop) = Executors::from_current(&PoolConfig::default()).unwrap();
        let cache = CacheConfig {
            memory_fraction: 0.95,
            storage_enabled: false,
            ..CacheConfig::default()
        };

        let result = ImageLoader::<String>::from_config(
            &cache,
            &DisplayConfig::default(),
            executors,
            counting_producer(Arc::new(AtomicUsize::new(0))),
        )
        .await;
        assert!(matches!(result, Err(OpenError::Config(_))));
    }
}
