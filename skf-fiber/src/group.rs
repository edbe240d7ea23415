use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::Waker;

use crossbeam::channel::Sender;
use skf_core::Result;

use crate::dispatcher::{FiberWaker, ShareMsg};
use crate::fiber::{FiberRef, FiberState, Signal};

/// State of a group that must be observable from foreign threads.
pub(crate) struct GroupExtern {
    pub(crate) name: String,
    pub(crate) stop: AtomicBool,
    pub(crate) finished: Mutex<bool>,
    pub(crate) finished_cv: Condvar,
}

pub(crate) struct GroupInner {
    pub(crate) fibers: HashMap<u64, Rc<FiberState>>,
    /// Fiber ids scheduled to run, drained round-robin by the dispatcher.
    pub(crate) ready: VecDeque<u64>,
    /// True while the group sits in the dispatcher's ready-group queue.
    pub(crate) in_ready_queue: bool,
    pub(crate) should_stop: bool,
    pub(crate) finished: bool,
    normal_count: usize,
    next_fiber_id: u64,
}

/// A scheduling bucket of fibers sharing one dispatcher thread.
///
/// Only touched on the owning dispatcher thread; cross-thread interaction
/// goes through [`GroupHandle`].
pub struct FiberGroup {
    pub(crate) id: u64,
    pub(crate) tx: Sender<ShareMsg>,
    pub(crate) ext: Arc<GroupExtern>,
    pub(crate) inner: RefCell<GroupInner>,
}

impl FiberGroup {
    pub(crate) fn new(id: u64, tx: Sender<ShareMsg>, ext: Arc<GroupExtern>) -> Rc<Self> {
        Rc::new(Self {
            id,
            tx,
            ext,
            inner: RefCell::new(GroupInner {
                fibers: HashMap::new(),
                ready: VecDeque::new(),
                in_ready_queue: false,
                should_stop: false,
                finished: false,
                normal_count: 0,
                next_fiber_id: 1,
            }),
        })
    }

    /// The group of the currently running fiber.
    #[must_use]
    pub fn current() -> Option<Rc<Self>> {
        crate::ctx::current_group()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.ext.name
    }

    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.inner.borrow().should_stop
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.borrow().finished
    }

    /// Spawn a normal fiber. Normal fibers keep the group alive until
    /// they finish.
    pub fn spawn<Fut>(&self, name: impl Into<String>, fut: Fut) -> FiberRef
    where
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.spawn_inner(name.into(), false, fut)
    }

    /// Spawn a daemon fiber. Daemons never keep the group alive and are
    /// dropped when the group finishes.
    pub fn spawn_daemon<Fut>(&self, name: impl Into<String>, fut: Fut) -> FiberRef
    where
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.spawn_inner(name.into(), true, fut)
    }

    fn spawn_inner<Fut>(&self, name: String, daemon: bool, fut: Fut) -> FiberRef
    where
        Fut: Future<Output = Result<()>> + 'static,
    {
        let fiber_id = {
            let mut inner = self.inner.borrow_mut();
            if inner.finished {
                tracing::warn!(
                    target: "skiff::fiber",
                    group = %self.ext.name,
                    fiber = %name,
                    "group finished, dropping spawn"
                );
                return FiberRef {
                    fiber: std::rc::Weak::new(),
                };
            }
            let id = inner.next_fiber_id;
            inner.next_fiber_id += 1;
            id
        };

        let log_name = name.clone();
        let body = Box::pin(async move {
            match fut.await {
                Ok(()) => {
                    tracing::debug!(target: "skiff::fiber", fiber = %log_name, "fiber finished");
                }
                Err(e) if e.is_shutdown() => {
                    tracing::info!(target: "skiff::fiber", fiber = %log_name, "fiber stopped: {e}");
                }
                Err(e) => skf_core::bug_err("fiber failed", &e),
            }
        });

        let waker = Waker::from(Arc::new(FiberWaker {
            tx: self.tx.clone(),
            group: self.id,
            fiber: fiber_id,
        }));
        let fiber = Rc::new(FiberState {
            id: fiber_id,
            name,
            daemon,
            signal: std::cell::Cell::new(None),
            scheduled: std::cell::Cell::new(false),
            body: RefCell::new(Some(body)),
            waker: RefCell::new(Some(waker)),
        });

        {
            let mut inner = self.inner.borrow_mut();
            inner.fibers.insert(fiber_id, Rc::clone(&fiber));
            if !daemon {
                inner.normal_count += 1;
            }
        }
        fiber.wake();
        FiberRef {
            fiber: Rc::downgrade(&fiber),
        }
    }

    /// Begin shutdown: cancel every normal fiber and let the group finish
    /// once they have drained. Daemons are dropped with the group.
    pub fn request_shutdown(&self) {
        let to_cancel: Vec<Rc<FiberState>> = {
            let mut inner = self.inner.borrow_mut();
            if inner.should_stop {
                return;
            }
            inner.should_stop = true;
            self.ext.stop.store(true, Ordering::Release);
            inner
                .fibers
                .values()
                .filter(|f| !f.daemon)
                .map(Rc::clone)
                .collect()
        };
        tracing::info!(
            target: "skiff::fiber",
            group = %self.ext.name,
            fibers = to_cancel.len(),
            "group shutdown requested"
        );
        for fiber in &to_cancel {
            fiber.post_signal(Signal::Cancel);
            fiber.wake();
        }
        self.update_finished();
    }

    pub(crate) fn finish_fiber(&self, fiber: &Rc<FiberState>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.fibers.remove(&fiber.id).is_none() {
                skf_core::bug("fiber not registered in its group");
                return;
            }
            if !fiber.daemon {
                inner.normal_count -= 1;
            }
        }
        self.update_finished();
    }

    fn update_finished(&self) {
        let newly_finished = {
            let mut inner = self.inner.borrow_mut();
            if !inner.finished && inner.should_stop && inner.normal_count == 0 {
                inner.finished = true;
                true
            } else {
                false
            }
        };
        if newly_finished {
            tracing::info!(target: "skiff::fiber", group = %self.ext.name, "group finished");
            let mut finished = lock_ignore_poison(&self.ext.finished);
            *finished = true;
            self.ext.finished_cv.notify_all();
        }
    }
}

pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cross-thread handle to a [`FiberGroup`].
#[derive(Clone)]
pub struct GroupHandle {
    pub(crate) tx: Sender<ShareMsg>,
    pub(crate) group_id: u64,
    pub(crate) ext: Arc<GroupExtern>,
}

impl GroupHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.ext.name
    }

    /// Spawn a fiber from any thread. The future itself is constructed on
    /// the dispatcher thread, so it may own group-local state.
    pub fn spawn<F, Fut>(&self, name: &str, daemon: bool, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let name = name.to_string();
        let group_id = self.group_id;
        self.send(Box::new(move |lp| {
            if let Some(group) = lp.group(group_id) {
                if daemon {
                    group.spawn_daemon(name, f());
                } else {
                    group.spawn(name, f());
                }
            } else {
                tracing::warn!(target: "skiff::fiber", group_id, "spawn on unknown group");
            }
        }));
    }

    /// Run a closure on the dispatcher thread, outside any fiber.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        self.send(Box::new(move |_| f()));
    }

    pub fn request_shutdown(&self) {
        let group_id = self.group_id;
        self.send(Box::new(move |lp| {
            if let Some(group) = lp.group(group_id) {
                group.request_shutdown();
            }
        }));
    }

    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.ext.stop.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        *lock_ignore_poison(&self.ext.finished)
    }

    /// Block until the group has finished. Must not be called from the
    /// dispatcher thread.
    pub fn join(&self) {
        let mut finished = lock_ignore_poison(&self.ext.finished);
        while !*finished {
            finished = match self.ext.finished_cv.wait(finished) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn send(&self, f: Box<dyn FnOnce(&mut crate::dispatcher::DispatcherLoop) + Send>) {
        if self.tx.send(ShareMsg::External(f)).is_err() {
            tracing::warn!(
                target: "skiff::fiber",
                group = %self.ext.name,
                "dispatcher gone, dropping message"
            );
        }
    }
}
