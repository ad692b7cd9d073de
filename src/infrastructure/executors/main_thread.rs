//! Dispatcher for work that must run on the main (UI) loop.
//!
//! Background workers never touch targets or listeners directly; they post
//! closures here and whoever owns the [`MainLoop`] runs them in order.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

type MainJob = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable sender side of the main loop.
#[derive(Clone)]
pub struct MainThread {
    tx: mpsc::UnboundedSender<MainJob>,
    handle: Handle,
}

/// Receiving side; run it on the thread that owns the UI.
pub struct MainLoop {
    rx: mpsc::UnboundedReceiver<MainJob>,
}

/// Creates a connected dispatcher and loop. Delayed posts use `handle`.
#[must_use]
pub fn main_thread(handle: Handle) -> (MainThread, MainLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MainThread { tx, handle }, MainLoop { rx })
}

impl MainThread {
    /// Queues `job` for the main loop.
    ///
    /// Returns false if the loop has been dropped; the job is discarded.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.tx.send(Box::new(job)).is_err() {
            trace!("Main loop gone, dropping job");
            return false;
        }
        true
    }

    /// Queues `job` for the main loop after `delay`.
    pub fn post_delayed(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let main = self.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            main.post(job);
        });
    }

    /// Returns true if the main loop has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for MainThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThread")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MainLoop {
    /// Runs every job queued so far without waiting. Returns how many ran.
    ///
    /// Meant for frame-driven UIs that drain the queue once per frame.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Waits for the next job and runs it.
    ///
    /// Returns false once every `MainThread` handle is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs until every `MainThread` handle is dropped.
    pub async fn run(mut self) {
        while self.run_next().await {}
    }

    /// Runs jobs as they arrive until `done` returns true or `timeout`
    /// elapses. Returns whether `done` was satisfied.
    pub async fn run_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(job)) => job(),
                Ok(None) | Err(_) => {
                    self.run_pending();
                    return done();
                }
            }
        }
    }
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoop").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_jobs_run_in_post_order() {
        let (main, mut main_loop) = main_thread(Handle::current());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            assert!(main.post(move || order.lock().push(i)));
        }

        assert_eq!(main_loop.run_pending(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_post_after_loop_dropped() {
        let (main, main_loop) = main_thread(Handle::current());
        drop(main_loop);

        assert!(main.is_closed());
        assert!(!main.post(|| {}));
    }

    #[tokio::test]
    async fn test_post_delayed_arrives() {
        let (main, mut main_loop) = main_thread(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        main.post_delayed(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(main_loop.run_pending(), 0);
        let done = main_loop
            .run_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 1)
            .await;
        assert!(done);
    }

    #[tokio::test]
    async fn test_run_stops_when_senders_dropped() {
        let (main, main_loop) = main_thread(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        main.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(main);

        main_loop.run().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
