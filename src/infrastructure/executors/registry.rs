//! The set of worker pools shared by every component.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::domain::errors::ConfigError;
use crate::infrastructure::config::PoolConfig;

use super::pool::PanicReporter;
use super::{MainLoop, MainThread, WorkerPool, main_thread};

/// Identifies one of the shared pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// General async work; unbounded.
    General,
    /// Network requests; sized to the CPU count.
    Http,
    /// Image load actions; sized to 1.5x the CPU count.
    Image,
    /// Storage cache maintenance; a single fixed worker.
    Storage,
}

/// Worker pools plus the main-thread dispatcher, built once and shared.
#[derive(Debug)]
pub struct Executors {
    general: Arc<WorkerPool>,
    http: Arc<WorkerPool>,
    image: Arc<WorkerPool>,
    storage: Arc<WorkerPool>,
    main: MainThread,
}

impl Executors {
    /// Builds the pools on `handle`.
    ///
    /// # Errors
    /// Returns `ZeroPoolSize` if a configured size is zero.
    pub fn new(handle: Handle, config: &PoolConfig) -> Result<(Arc<Self>, MainLoop), ConfigError> {
        let (main, main_loop) = main_thread(handle.clone());
        let reporter = PanicReporter::new(config.panic_policy, main.clone());
        let cpus = cpu_count();

        let http_size = config.http_size.unwrap_or(cpus);
        let image_size = config.image_size.unwrap_or_else(|| (cpus * 3).div_ceil(2));

        let executors = Self {
            general: Arc::new(WorkerPool::unbounded(
                "general",
                handle.clone(),
                reporter.clone(),
            )),
            http: Arc::new(WorkerPool::bounded(
                "http",
                handle.clone(),
                http_size,
                true,
                reporter.clone(),
            )?),
            image: Arc::new(WorkerPool::bounded(
                "image",
                handle.clone(),
                image_size,
                true,
                reporter.clone(),
            )?),
            storage: Arc::new(WorkerPool::bounded("storage", handle, 1, false, reporter)?),
            main,
        };

        info!(http = http_size, image = image_size, "Worker pools ready");
        Ok((Arc::new(executors), main_loop))
    }

    /// Builds the pools on the current tokio runtime.
    ///
    /// # Errors
    /// Returns `ZeroPoolSize` if a configured size is zero.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn from_current(config: &PoolConfig) -> Result<(Arc<Self>, MainLoop), ConfigError> {
        Self::new(Handle::current(), config)
    }

    /// General-purpose pool.
    #[must_use]
    pub const fn general(&self) -> &Arc<WorkerPool> {
        &self.general
    }

    /// Pool for network requests.
    #[must_use]
    pub const fn http(&self) -> &Arc<WorkerPool> {
        &self.http
    }

    /// Pool running image load actions.
    #[must_use]
    pub const fn image(&self) -> &Arc<WorkerPool> {
        &self.image
    }

    /// Single-worker pool for storage maintenance.
    #[must_use]
    pub const fn storage(&self) -> &Arc<WorkerPool> {
        &self.storage
    }

    /// Dispatcher onto the main loop.
    #[must_use]
    pub const fn main(&self) -> &MainThread {
        &self.main
    }

    /// Returns the pool for `kind`.
    #[must_use]
    pub const fn pool(&self, kind: PoolKind) -> &Arc<WorkerPool> {
        match kind {
            PoolKind::General => &self.general,
            PoolKind::Http => &self.http,
            PoolKind::Image => &self.image,
            PoolKind::Storage => &self.storage,
        }
    }

    /// Resizes a pool at runtime.
    ///
    /// # Errors
    /// Returns `FixedPool` for the storage pool and `ZeroPoolSize` for `0`.
    pub fn set_pool_size(&self, kind: PoolKind, size: usize) -> Result<(), ConfigError> {
        self.pool(kind).set_size(size)
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}
