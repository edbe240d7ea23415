//! User state machine contract, consumed by apply and snapshot install.

use bytes::Bytes;
use skf_core::{Result, Term};

/// One client proposal as handed to the state machine.
#[derive(Debug, Clone, Default)]
pub struct RaftInput {
    pub biz_type: u32,
    pub header: Bytes,
    pub body: Bytes,
}

impl RaftInput {
    #[must_use]
    pub fn new(biz_type: u32, header: Bytes, body: Bytes) -> Self {
        Self {
            biz_type,
            header,
            body,
        }
    }

    /// Payload size as counted by admission control.
    #[must_use]
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

/// A snapshot being read chunk by chunk, for boot restore or for
/// streaming to a lagging follower.
pub trait Snapshot: Send {
    fn last_included_index(&self) -> u64;
    fn last_included_term(&self) -> Term;
    /// Next chunk, `None` at end.
    fn read_next(&mut self) -> Result<Option<Bytes>>;
}

/// The replicated state machine. `exec` is invoked strictly in index
/// order, one call at a time per group. An error from any method is
/// fatal to the group.
pub trait StateMachine: Send {
    fn exec(&mut self, index: u64, term: Term, input: &RaftInput) -> Result<Bytes>;

    /// Apply one snapshot chunk. `offset` is the byte offset of `data`
    /// within the snapshot stream; the final call has `done = true` and
    /// commits the whole install.
    fn install_snapshot(
        &mut self,
        last_included_index: u64,
        last_included_term: Term,
        offset: u64,
        done: bool,
        data: &[u8],
    ) -> Result<()>;

    fn take_snapshot(&mut self) -> Result<Box<dyn Snapshot>>;

    fn close(&mut self) -> Result<()>;
}
