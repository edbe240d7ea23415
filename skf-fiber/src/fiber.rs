use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::task::Waker;

/// Signal posted to a fiber, observed at its next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// `interrupt()` was called; wakes the fiber with
    /// `RaftError::FiberInterrupt`.
    Interrupt,
    /// The group is shutting down; wakes the fiber with
    /// `RaftError::FiberCancel`.
    Cancel,
}

pub(crate) type FiberBody = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct FiberState {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) daemon: bool,
    pub(crate) signal: Cell<Option<Signal>>,
    /// True while the fiber sits in its group's ready queue.
    pub(crate) scheduled: Cell<bool>,
    /// The suspended body. Taken out for the duration of a poll.
    pub(crate) body: RefCell<Option<FiberBody>>,
    pub(crate) waker: RefCell<Option<Waker>>,
}

impl FiberState {
    pub(crate) fn post_signal(&self, signal: Signal) {
        // An earlier undelivered signal wins; both are terminal.
        if self.signal.get().is_none() {
            self.signal.set(Some(signal));
        }
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.borrow().as_ref() {
            waker.wake_by_ref();
        }
    }
}

/// In-thread reference to a fiber, usable to interrupt it.
///
/// Only valid on the owning dispatcher thread. The reference is weak: a
/// finished fiber makes `interrupt` a no-op.
#[derive(Clone)]
pub struct FiberRef {
    pub(crate) fiber: Weak<FiberState>,
}

impl FiberRef {
    /// Post an interrupt. A suspended fiber wakes with
    /// `RaftError::FiberInterrupt`; a running one observes the signal at
    /// its next suspension point.
    pub fn interrupt(&self) {
        if let Some(fiber) = self.fiber.upgrade() {
            tracing::debug!(target: "skiff::fiber", fiber = %fiber.name, "interrupt");
            fiber.post_signal(Signal::Interrupt);
            fiber.wake();
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.fiber.strong_count() == 0
    }
}
