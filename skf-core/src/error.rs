use thiserror::Error;

use crate::{GroupId, NodeId, Term};

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not leader, last known leader: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("stale term: request {request}, local {local}")]
    StaleTerm { request: Term, local: Term },

    #[error("log gap: first index of batch {first}, expected {expected}")]
    LogGap { first: u64, expected: u64 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("store corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("fiber interrupted")]
    FiberInterrupt,

    #[error("fiber cancelled")]
    FiberCancel,

    #[error("group is stopping")]
    Stopped,

    #[error("deadline elapsed")]
    Timeout,

    #[error("state machine failed: {0}")]
    StateMachine(String),

    #[error("too many pending {resource}: current {current}, max {max}")]
    Backpressure {
        resource: &'static str,
        current: u64,
        max: u64,
    },

    #[error("request body too large: {size} bytes, max {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("group {group_id} not found")]
    GroupNotFound { group_id: GroupId },

    #[error("group {group_id} is in error state")]
    GroupFailed { group_id: GroupId },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// True for the shutdown-class errors that must propagate without retry:
    /// fiber interruption, voluntary cancellation, and group stop.
    #[inline]
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(
            self,
            RaftError::FiberInterrupt | RaftError::FiberCancel | RaftError::Stopped
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_classification() {
        assert!(RaftError::FiberInterrupt.is_shutdown());
        assert!(RaftError::FiberCancel.is_shutdown());
        assert!(RaftError::Stopped.is_shutdown());
        assert!(!RaftError::Timeout.is_shutdown());
        assert!(!RaftError::Io(std::io::Error::other("boom")).is_shutdown());
    }

    #[test]
    fn test_display_carries_context() {
        let e = RaftError::Backpressure {
            resource: "writes",
            current: 101,
            max: 100,
        };
        let msg = e.to_string();
        assert!(msg.contains("writes"));
        assert!(msg.contains("101"));
    }
}
