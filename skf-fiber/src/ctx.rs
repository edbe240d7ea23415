//! Thread-local execution context.
//!
//! While the dispatcher polls a fiber, the current group and fiber are
//! published here so wait sources can observe signals and the timer can
//! register deadlines without threading handles through every call.

use std::cell::RefCell;
use std::rc::Rc;
use std::task::Waker;
use std::time::Instant;

use skf_core::{RaftError, Result};

use crate::dispatcher::TimerQueue;
use crate::fiber::{FiberState, Signal};
use crate::group::FiberGroup;

struct Current {
    group: Rc<FiberGroup>,
    fiber: Rc<FiberState>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
    static TIMERS: RefCell<Option<Rc<RefCell<TimerQueue>>>> = const { RefCell::new(None) };
}

pub(crate) struct CtxGuard;

impl Drop for CtxGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.borrow_mut().take());
    }
}

pub(crate) fn enter(group: Rc<FiberGroup>, fiber: Rc<FiberState>) -> CtxGuard {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(Current { group, fiber });
    });
    CtxGuard
}

pub(crate) fn install_timers(timers: Rc<RefCell<TimerQueue>>) {
    TIMERS.with(|t| *t.borrow_mut() = Some(timers));
}

pub(crate) fn clear_timers() {
    TIMERS.with(|t| t.borrow_mut().take());
}

/// Take a pending signal of the current fiber, if any, converting it to
/// the matching terminal error. Every wait source calls this first.
pub(crate) fn check_signal() -> Result<()> {
    CURRENT.with(|c| {
        let borrow = c.borrow();
        let Some(current) = borrow.as_ref() else {
            return Ok(());
        };
        match current.fiber.signal.take() {
            None => Ok(()),
            Some(Signal::Interrupt) => Err(RaftError::FiberInterrupt),
            Some(Signal::Cancel) => Err(RaftError::FiberCancel),
        }
    })
}

/// The group of the currently running fiber.
#[must_use]
pub fn current_group() -> Option<Rc<FiberGroup>> {
    CURRENT.with(|c| c.borrow().as_ref().map(|cur| Rc::clone(&cur.group)))
}

/// True when the current fiber's group has been asked to stop. False
/// outside fiber context.
#[must_use]
pub fn group_should_stop() -> bool {
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .is_some_and(|cur| cur.group.should_stop())
    })
}

/// Register a timer wake-up with the dispatcher owning this thread.
pub(crate) fn register_timer(deadline: Instant, waker: Waker) -> Result<()> {
    TIMERS.with(|t| {
        let borrow = t.borrow();
        let Some(timers) = borrow.as_ref() else {
            return Err(RaftError::Internal(
                "timer used outside a dispatcher thread".into(),
            ));
        };
        timers.borrow_mut().register(deadline, waker);
        Ok(())
    })
}
