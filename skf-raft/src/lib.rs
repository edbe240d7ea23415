//! Multi-group Raft consensus engine.
//!
//! A [`RaftServer`] hosts N independent consensus groups inside one
//! process. Groups share one dispatcher thread (the fiber runtime), one
//! blocking-I/O executor and one transport; each group owns its role
//! state, member table, vote bookkeeping, segmented log and apply
//! pipeline. Cross-thread entry points are [`RaftServer::submit_linear_task`],
//! [`RaftServer::get_log_index_for_read`] and the transport's incoming
//! request channels; everything else runs on group fibers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod apply;
pub mod codec;
mod commit;
mod engine;
mod group;
mod member;
mod server;
mod sm;
mod snapshot;
mod status;
mod tail;
mod transport;
mod vote;

pub use group::RaftGroup;
pub use member::RaftMember;
pub use server::{GroupInput, PendingWrite, RaftServer};
pub use sm::{RaftInput, Snapshot, StateMachine};
pub use status::{FirstCommitGate, RaftRole, ShareStatus};
pub use transport::{IncomingRequest, RaftTransport, RequestHandler};
