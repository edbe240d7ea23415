//! Cooperative fiber runtime.
//!
//! Fibers are named cooperative tasks multiplexed onto one dispatcher
//! thread. Every fiber belongs to a [`FiberGroup`]; all fibers of a group
//! run on the same thread, so group state needs no locking. Suspension
//! happens only at explicit await points on the runtime's own wait
//! sources: [`FiberFuture`], [`FiberCondition`], [`FiberChannel`] and the
//! timer ([`sleep`], [`with_deadline`]). Blocking work belongs on the
//! [`IoExecutor`] pool, which completes a `FiberFuture` back into the
//! dispatcher.
//!
//! Cross-thread entry points (future completion, channel sends, group
//! shutdown) funnel through the dispatcher's share queue and are applied
//! between fiber polls.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod channel;
mod condition;
mod ctx;
mod dispatcher;
mod fiber;
mod future;
mod group;
mod io_executor;
mod retry;
mod timer;

pub use channel::{ChannelSender, FiberChannel};
pub use condition::FiberCondition;
pub use ctx::{current_group, group_should_stop};
pub use dispatcher::Dispatcher;
pub use fiber::FiberRef;
pub use future::{FiberFuture, FutureCompleter};
pub use group::{FiberGroup, GroupHandle};
pub use io_executor::IoExecutor;
pub use retry::io_retry;
pub use timer::{Sleep, WithDeadline, sleep, sleep_until, with_deadline};
