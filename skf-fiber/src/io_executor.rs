use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::channel::{Sender, unbounded};
use skf_core::Result;

use crate::future::FiberFuture;
use crate::group::lock_ignore_poison;

type Job = Box<dyn FnOnce() + Send>;

struct ExecInner {
    workers: Vec<Sender<Job>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// Fixed pool of threads for blocking file I/O. Jobs complete a
/// [`FiberFuture`] that the submitting fiber awaits; nothing here ever
/// runs on a dispatcher thread.
///
/// Jobs submitted with the same key run on the same worker, which gives
/// in-order execution per key. Log writes key by segment start position
/// so writes to one file are serialised.
pub struct IoExecutor {
    inner: Mutex<ExecInner>,
    next: AtomicUsize,
}

impl IoExecutor {
    #[must_use]
    pub fn new(name: &str, threads: usize) -> Self {
        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let (tx, rx) = unbounded::<Job>();
            let builder = std::thread::Builder::new().name(format!("skiff-io-{name}-{i}"));
            match builder.spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            }) {
                Ok(handle) => {
                    workers.push(tx);
                    handles.push(handle);
                }
                Err(e) => {
                    tracing::error!(target: "skiff::fiber", "spawn io worker: {e}");
                }
            }
        }
        Self {
            inner: Mutex::new(ExecInner { workers, handles }),
            next: AtomicUsize::new(0),
        }
    }

    /// Run a blocking job on any worker.
    pub fn submit<T, F>(&self, job: F) -> FiberFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        self.submit_at(slot, job)
    }

    /// Run a blocking job on the worker owning `key`. Same key, same
    /// worker: submission order is execution order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn submit_keyed<T, F>(&self, key: u64, job: F) -> FiberFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.submit_at(key as usize, job)
    }

    fn submit_at<T, F>(&self, slot: usize, job: F) -> FiberFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (future, completer) = FiberFuture::new();
        let inner = lock_ignore_poison(&self.inner);
        if inner.workers.is_empty() {
            drop(inner);
            completer.complete(Err(skf_core::RaftError::Stopped));
            return future;
        }
        let worker = &inner.workers[slot % inner.workers.len()];
        let sent = worker.send(Box::new(move || completer.complete(job())));
        if sent.is_err() {
            return FiberFuture::ready(Err(skf_core::RaftError::Stopped));
        }
        future
    }

    /// Stop accepting jobs, run out the queues and join the workers.
    pub fn shutdown(&self) {
        let (workers, handles) = {
            let mut inner = lock_ignore_poison(&self.inner);
            (
                std::mem::take(&mut inner.workers),
                std::mem::take(&mut inner.handles),
            )
        };
        drop(workers);
        for handle in handles {
            if handle.join().is_err() {
                skf_core::bug("io worker panicked");
            }
        }
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
