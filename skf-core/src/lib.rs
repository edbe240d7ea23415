#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod buglog;
mod checksum;
mod config;
mod error;
mod pending;

pub use buglog::{bug, bug_err};
pub use checksum::crc32;
pub use config::{GroupConfig, NodeAddr, ServerConfig, parse_member_ids, parse_servers};
pub use error::{RaftError, Result};
pub use pending::{PendingGate, PendingTicket};

/// Node identifier, unique across the whole deployment.
pub type NodeId = u32;

/// Consensus group identifier, unique within one process.
pub type GroupId = u32;

/// Raft term. Monotonic non-decreasing through the life of a node.
pub type Term = u32;
