use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use skf_core::Result;

use crate::group::lock_ignore_poison;
use crate::timer::{WithDeadline, with_deadline};

struct FutState<T> {
    result: Option<Result<T>>,
    waker: Option<Waker>,
    completed: bool,
}

/// Single-fire future. The waiting side lives on a dispatcher thread; the
/// completing side may be any thread (I/O pool, RPC callback). The first
/// completion wins, later ones are dropped.
pub struct FiberFuture<T> {
    state: Arc<Mutex<FutState<T>>>,
}

pub struct FutureCompleter<T> {
    state: Arc<Mutex<FutState<T>>>,
}

impl<T> Clone for FutureCompleter<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> FiberFuture<T> {
    #[must_use]
    pub fn new() -> (Self, FutureCompleter<T>) {
        let state = Arc::new(Mutex::new(FutState {
            result: None,
            waker: None,
            completed: false,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            FutureCompleter { state },
        )
    }

    /// An already-completed future.
    #[must_use]
    pub fn ready(result: Result<T>) -> Self {
        let (future, completer) = Self::new();
        completer.complete(result);
        future
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        lock_ignore_poison(&self.state).completed
    }

    /// Await with an absolute deadline; elapses to `RaftError::Timeout`.
    /// The completion itself is not cancelled, its result is discarded.
    #[must_use]
    pub fn deadline(self, deadline: Instant) -> WithDeadline<Self> {
        with_deadline(self, deadline)
    }
}

impl<T> FutureCompleter<T> {
    pub fn complete(&self, result: Result<T>) {
        let waker = {
            let mut state = lock_ignore_poison(&self.state);
            if state.completed {
                tracing::debug!(target: "skiff::fiber", "dropping duplicate completion");
                return;
            }
            state.completed = true;
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Future for FiberFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        crate::ctx::check_signal()?;
        let mut state = lock_ignore_poison(&self.state);
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}
