use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use skf_core::Result;

/// Suspend the current fiber for `duration`. Wakes early with a terminal
/// error if the fiber is interrupted or its group shuts down.
#[must_use]
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

#[must_use]
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep { deadline }
}

pub struct Sleep {
    deadline: Instant,
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        crate::ctx::check_signal()?;
        if Instant::now() >= self.deadline {
            return Poll::Ready(Ok(()));
        }
        if let Err(e) = crate::ctx::register_timer(self.deadline, cx.waker().clone()) {
            return Poll::Ready(Err(e));
        }
        Poll::Pending
    }
}

/// Bound a wait source with an absolute deadline. The inner operation is
/// not cancelled on timeout; its eventual result is discarded.
#[must_use]
pub fn with_deadline<F>(inner: F, deadline: Instant) -> WithDeadline<F> {
    WithDeadline { inner, deadline }
}

pub struct WithDeadline<F> {
    inner: F,
    deadline: Instant,
}

impl<F, T> Future for WithDeadline<F>
where
    F: Future<Output = Result<T>> + Unpin,
{
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(result) = Pin::new(&mut self.inner).poll(cx) {
            return Poll::Ready(result);
        }
        if Instant::now() >= self.deadline {
            return Poll::Ready(Err(skf_core::RaftError::Timeout));
        }
        if let Err(e) = crate::ctx::register_timer(self.deadline, cx.waker().clone()) {
            return Poll::Ready(Err(e));
        }
        Poll::Pending
    }
}
