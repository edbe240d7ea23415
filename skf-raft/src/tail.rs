//! Tail cache: pending proposals on the leader, keyed by log index.
//!
//! Entries leave the cache when the apply fiber completes them, or when
//! the proposal is aborted by truncation, role change or group error.
//! The client-side future is a blocking receiver owned by the caller;
//! the admission ticket rides along and is released on completion.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use bytes::Bytes;
use skf_core::{NodeId, PendingTicket, RaftError, Result, Term};

use crate::sm::RaftInput;

pub(crate) struct RaftTask {
    pub item_type: u8,
    pub input: RaftInput,
    pub term: Term,
    pub reply: Option<Sender<Result<Bytes>>>,
    pub ticket: Option<PendingTicket>,
}

impl RaftTask {
    pub(crate) fn noop() -> Self {
        Self {
            item_type: skf_store::LogItem::TYPE_NOOP,
            input: RaftInput::default(),
            term: 0,
            reply: None,
            ticket: None,
        }
    }

    pub(crate) fn finish(mut self, result: Result<Bytes>) {
        if let Some(reply) = self.reply.take() {
            // A departed caller is fine; the ticket still releases below.
            let _ = reply.send(result);
        }
        drop(self.ticket.take());
    }
}

#[derive(Default)]
pub(crate) struct TailCache {
    map: BTreeMap<u64, RaftTask>,
}

impl TailCache {
    pub(crate) fn insert(&mut self, index: u64, task: RaftTask) {
        if self.map.insert(index, task).is_some() {
            skf_core::bug("tail cache index reused");
        }
    }

    pub(crate) fn complete(&mut self, index: u64, result: Result<Bytes>) {
        if let Some(task) = self.map.remove(&index) {
            task.finish(result);
        }
    }

    /// Abort every pending proposal at or above `first_index`; used when
    /// a follower truncates the divergent tail of a deposed leader.
    pub(crate) fn abort_from(&mut self, first_index: u64, leader: Option<NodeId>) {
        let aborted = self.map.split_off(&first_index);
        for (_, task) in aborted {
            task.finish(Err(RaftError::NotLeader { leader }));
        }
    }

    pub(crate) fn abort_all(&mut self, err: impl Fn() -> RaftError) {
        let map = std::mem::take(&mut self.map);
        for (_, task) in map {
            task.finish(Err(err()));
        }
    }

    /// Drop entries at or below the applied index. The apply fiber
    /// completes them as it goes, so anything found here is a leak.
    pub(crate) fn clean_pending(&mut self, last_applied: u64) {
        let keep = self.map.split_off(&(last_applied + 1));
        let stale = std::mem::replace(&mut self.map, keep);
        if !stale.is_empty() {
            skf_core::bug("tail cache held entries below applied index");
            for (_, task) in stale {
                task.finish(Err(RaftError::Internal("stale pending proposal".into())));
            }
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
