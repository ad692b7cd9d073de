//! Bounded worker pools on top of the tokio runtime.
//!
//! A pool is a named lane with a concurrency limit: every task spawned
//! through it holds one permit while it runs. Panics are caught at the pool
//! boundary and handed to the configured [`PanicPolicy`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::domain::errors::ConfigError;

use super::MainThread;

/// What happens when a task inside a pool panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicPolicy {
    /// Log the panic and carry on.
    #[default]
    Log,
    /// Log the panic and resume unwinding on the main loop.
    RethrowOnMain,
}

#[derive(Clone)]
pub(crate) struct PanicReporter {
    policy: PanicPolicy,
    main: MainThread,
}

impl PanicReporter {
    pub(crate) const fn new(policy: PanicPolicy, main: MainThread) -> Self {
        Self { policy, main }
    }

    fn report(&self, pool: &'static str, payload: Box<dyn Any + Send>) {
        error!(pool, message = panic_message(payload.as_ref()), "Worker task panicked");
        if self.policy == PanicPolicy::RethrowOnMain {
            self.main.post(move || std::panic::resume_unwind(payload));
        }
    }
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// A named, optionally bounded lane for background work.
pub struct WorkerPool {
    name: &'static str,
    handle: Handle,
    limit: Option<Limit>,
    reporter: PanicReporter,
}

struct Limit {
    permits: Arc<Semaphore>,
    size: Mutex<usize>,
    resizable: bool,
}

impl WorkerPool {
    pub(crate) fn bounded(
        name: &'static str,
        handle: Handle,
        size: usize,
        resizable: bool,
        reporter: PanicReporter,
    ) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroPoolSize { pool: name });
        }
        Ok(Self {
            name,
            handle,
            limit: Some(Limit {
                permits: Arc::new(Semaphore::new(size)),
                size: Mutex::new(size),
                resizable,
            }),
            reporter,
        })
    }

    pub(crate) const fn unbounded(
        name: &'static str,
        handle: Handle,
        reporter: PanicReporter,
    ) -> Self {
        Self {
            name,
            handle,
            limit: None,
            reporter,
        }
    }

    /// Returns the pool name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the concurrency limit, or `None` for an unbounded pool.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.limit.as_ref().map(|l| *l.size.lock())
    }

    /// Returns the number of tasks that could start right now.
    #[must_use]
    pub fn available(&self) -> Option<usize> {
        self.limit.as_ref().map(|l| l.permits.available_permits())
    }

    /// Changes the concurrency limit.
    ///
    /// Shrinking takes effect as running tasks finish; nothing is aborted.
    /// Unbounded pools ignore resizing.
    ///
    /// # Errors
    /// Returns `ZeroPoolSize` for `0` and `FixedPool` for pools created
    /// with a fixed size.
    pub fn set_size(&self, new_size: usize) -> Result<(), ConfigError> {
        if new_size == 0 {
            return Err(ConfigError::ZeroPoolSize { pool: self.name });
        }
        let Some(limit) = &self.limit else {
            debug!(pool = self.name, "Ignoring resize of unbounded pool");
            return Ok(());
        };
        if !limit.resizable {
            return Err(ConfigError::FixedPool { pool: self.name });
        }

        let mut size = limit.size.lock();
        let old = *size;
        *size = new_size;
        drop(size);

        if new_size > old {
            limit.permits.add_permits(new_size - old);
        } else if new_size < old {
            let permits = limit.permits.clone();
            let excess = u32::try_from(old - new_size).unwrap_or(u32::MAX);
            self.handle.spawn(async move {
                if let Ok(permit) = permits.acquire_many_owned(excess).await {
                    permit.forget();
                }
            });
        }
        debug!(pool = self.name, old, new = new_size, "Resized worker pool");
        Ok(())
    }

    /// Spawns `task` on the pool.
    ///
    /// The task waits for a permit before running. If it panics, the
    /// handle resolves to `None` and the panic goes to the pool's policy.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.limit.as_ref().map(|l| l.permits.clone());
        let reporter = self.reporter.clone();
        let name = self.name;
        self.handle.spawn(async move {
            let _permit = match permits {
                Some(permits) => Some(permits.acquire_owned().await.ok()?),
                None => None,
            };
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(output) => Some(output),
                Err(payload) => {
                    reporter.report(name, payload);
                    None
                }
            }
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::executors::{MainLoop, main_thread};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn reporter(policy: PanicPolicy) -> (PanicReporter, MainLoop) {
        let (main, main_loop) = main_thread(Handle::current());
        (PanicReporter::new(policy, main), main_loop)
    }

    async fn explode() {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let (rep, _loop) = reporter(PanicPolicy::Log);
        let result = WorkerPool::bounded("image", Handle::current(), 0, true, rep);
        assert!(matches!(result, Err(ConfigError::ZeroPoolSize { pool: "image" })));
    }

    #[tokio::test]
    async fn test_fixed_pool_rejects_resize() -> Result<(), ConfigError> {
        let (rep, _loop) = reporter(PanicPolicy::Log);
        let pool = WorkerPool::bounded("storage", Handle::current(), 1, false, rep)?;
        assert!(matches!(pool.set_size(2), Err(ConfigError::FixedPool { .. })));
        assert_eq!(pool.size(), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_grow_adds_permits() -> Result<(), ConfigError> {
        let (rep, _loop) = reporter(PanicPolicy::Log);
        let pool = WorkerPool::bounded("http", Handle::current(), 2, true, rep)?;
        pool.set_size(5)?;
        assert_eq!(pool.size(), Some(5));
        assert_eq!(pool.available(), Some(5));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_limit() -> Result<(), ConfigError> {
        let (rep, _loop) = reporter(PanicPolicy::Log);
        let pool = WorkerPool::bounded("image", Handle::current(), 2, true, rep)?;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (rep, mut main_loop) = reporter(PanicPolicy::Log);
        let pool = WorkerPool::unbounded("general", Handle::current(), rep);

        let result = pool.spawn(explode()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(main_loop.run_pending(), 0);
    }

    #[tokio::test]
    async fn test_rethrow_on_main_posts_panic() {
        let (rep, mut main_loop) = reporter(PanicPolicy::RethrowOnMain);
        let pool = WorkerPool::unbounded("general", Handle::current(), rep);

        let result = pool.spawn(explode()).await.unwrap();
        assert!(result.is_none());

        let rethrown = std::panic::catch_unwind(AssertUnwindSafe(|| main_loop.run_pending()));
        let payload = rethrown.expect_err("panic should resurface on the main loop");
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
