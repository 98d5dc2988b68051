//! Unbounded pool of short-lived background workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker pool is shut down")]
pub struct PoolClosedError;

/// Runs each submitted task on its own short-lived named thread.
///
/// Tasks submitted after shutdown begins are rejected, not queued; workers
/// must not retain references to node state beyond their own completion
/// (capture `Weak` handles).
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    active: Mutex<usize>,
    idle: Condvar,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                shutdown: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                active: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Spawn a worker for `task`. Fails once shutdown has begun.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolClosedError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(PoolClosedError);
        }

        *self.inner.active.lock() += 1;
        let inner = self.inner.clone();
        let worker = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.inner.name, worker))
            .spawn(move || {
                task();
                let mut active = inner.active.lock();
                *active -= 1;
                if *active == 0 {
                    inner.idle.notify_all();
                }
            });

        if spawned.is_err() {
            *self.inner.active.lock() -= 1;
            return Err(PoolClosedError);
        }
        Ok(())
    }

    pub fn active_workers(&self) -> usize {
        *self.inner.active.lock()
    }

    /// Stop accepting tasks and wait for in-flight workers to finish.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let mut active = self.inner.active.lock();
        while *active > 0 {
            self.inner.idle.wait(&mut active);
        }
    }
}
