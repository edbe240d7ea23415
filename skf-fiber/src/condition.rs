use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use skf_core::Result;

use crate::group::lock_ignore_poison;
use crate::timer::{WithDeadline, with_deadline};

struct CondInner {
    epoch: u64,
    wakers: Vec<Waker>,
}

/// Multi-waiter signal. `signal_all` wakes every fiber whose wait started
/// before the signal; waits started after it block until the next one.
#[derive(Clone)]
pub struct FiberCondition {
    inner: Arc<Mutex<CondInner>>,
}

impl Default for FiberCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberCondition {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CondInner {
                epoch: 0,
                wakers: Vec::new(),
            })),
        }
    }

    pub fn signal_all(&self) {
        let wakers = {
            let mut inner = lock_ignore_poison(&self.inner);
            inner.epoch += 1;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    #[must_use]
    pub fn wait(&self) -> CondWait {
        let epoch = lock_ignore_poison(&self.inner).epoch;
        CondWait {
            inner: Arc::clone(&self.inner),
            start_epoch: epoch,
        }
    }

    /// Wait with an absolute deadline; elapses to `RaftError::Timeout`.
    #[must_use]
    pub fn wait_deadline(&self, deadline: Instant) -> WithDeadline<CondWait> {
        with_deadline(self.wait(), deadline)
    }
}

pub struct CondWait {
    inner: Arc<Mutex<CondInner>>,
    start_epoch: u64,
}

impl Future for CondWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        crate::ctx::check_signal()?;
        let mut inner = lock_ignore_poison(&self.inner);
        if inner.epoch != self.start_epoch {
            return Poll::Ready(Ok(()));
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
