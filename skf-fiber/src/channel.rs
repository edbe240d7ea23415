use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use skf_core::Result;

use crate::group::lock_ignore_poison;
use crate::timer::{WithDeadline, with_deadline};

struct ChanInner<T> {
    queue: VecDeque<T>,
    wakers: VecDeque<Waker>,
}

/// Unbounded message queue. The receiving side is a fiber; sending is
/// allowed from any thread through a [`ChannelSender`].
pub struct FiberChannel<T> {
    inner: Arc<Mutex<ChanInner<T>>>,
}

pub struct ChannelSender<T> {
    inner: Arc<Mutex<ChanInner<T>>>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FiberChannel<T> {
    #[must_use]
    pub fn new() -> (Self, ChannelSender<T>) {
        let inner = Arc::new(Mutex::new(ChanInner {
            queue: VecDeque::new(),
            wakers: VecDeque::new(),
        }));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            ChannelSender { inner },
        )
    }

    pub fn offer(&self, value: T) {
        offer(&self.inner, value);
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        lock_ignore_poison(&self.inner).queue.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.inner).queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn recv(&self) -> Recv<'_, T> {
        Recv { channel: self }
    }

    /// Receive with an absolute deadline; elapses to `RaftError::Timeout`.
    #[must_use]
    pub fn recv_deadline(&self, deadline: Instant) -> WithDeadline<Recv<'_, T>> {
        with_deadline(self.recv(), deadline)
    }
}

impl<T> ChannelSender<T> {
    pub fn send(&self, value: T) {
        offer(&self.inner, value);
    }
}

fn offer<T>(inner: &Arc<Mutex<ChanInner<T>>>, value: T) {
    let waker = {
        let mut inner = lock_ignore_poison(inner);
        inner.queue.push_back(value);
        inner.wakers.pop_front()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

pub struct Recv<'a, T> {
    channel: &'a FiberChannel<T>,
}

impl<T> Future for Recv<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        crate::ctx::check_signal()?;
        let mut inner = lock_ignore_poison(&self.channel.inner);
        if let Some(value) = inner.queue.pop_front() {
            return Poll::Ready(Ok(value));
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push_back(cx.waker().clone());
        }
        Poll::Pending
    }
}
