//! Per-group role state and the lock-free published snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use skf_core::{NodeId, RaftError, Result, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    /// Replicates but never votes, never counts in quorums and never
    /// campaigns.
    Observer,
}

/// Completed the first time apply passes the new leader's first entry of
/// its term, or failed when leadership is lost before that. Readers
/// outside the dispatcher block on it with a deadline. Also reused as
/// the per-group startup readiness gate.
pub struct FirstCommitGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default, Clone, Copy)]
struct GateState {
    done: bool,
    failed: bool,
}

impl FirstCommitGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn complete(&self) {
        let mut state = self.lock();
        state.done = true;
        self.cv.notify_all();
    }

    /// Leadership was lost before the first commit applied; waiters get
    /// `NotLeader` rather than hanging to their deadline.
    pub fn fail(&self) {
        let mut state = self.lock();
        if !state.done {
            state.done = true;
            state.failed = true;
        }
        self.cv.notify_all();
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<()> {
        let mut state = self.lock();
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return Err(RaftError::Timeout);
            }
            let (guard, timeout) = match self.cv.wait_timeout(state, deadline - now) {
                Ok(r) => r,
                Err(p) => p.into_inner(),
            };
            state = guard;
            if timeout.timed_out() && !state.done {
                return Err(RaftError::Timeout);
            }
        }
        if state.failed {
            return Err(RaftError::NotLeader { leader: None });
        }
        Ok(())
    }
}

/// Frozen snapshot published by the group fiber whenever role, leader,
/// lease or applied state changes; read without locks by foreign threads.
#[derive(Clone)]
pub struct ShareStatus {
    pub role: RaftRole,
    pub term: Term,
    pub current_leader: Option<NodeId>,
    pub lease_end: Option<Instant>,
    pub last_applied: u64,
    pub first_commit_gate: Option<Arc<FirstCommitGate>>,
    pub group_ready: bool,
}

impl Default for ShareStatus {
    fn default() -> Self {
        Self {
            role: RaftRole::Follower,
            term: 0,
            current_leader: None,
            lease_end: None,
            last_applied: 0,
            first_commit_gate: None,
            group_ready: false,
        }
    }
}

/// Cross-thread view of one group.
pub struct GroupShared {
    pub share: ArcSwap<ShareStatus>,
    pub error: AtomicBool,
}

impl GroupShared {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            share: ArcSwap::from_pointee(ShareStatus::default()),
            error: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }
}

/// Volatile per-group state, mutated only by the group's fibers.
pub struct RaftStatus {
    pub role: RaftRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub current_leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: Term,
    pub last_persist_index: u64,
    pub last_persist_term: Term,
    /// Term and index covered by the installed snapshot, if any.
    pub last_snapshot_index: u64,
    pub last_snapshot_term: Term,
    pub lease_end: Option<Instant>,
    pub last_elect_time: Instant,
    pub heartbeat_time: Instant,
    pub elect_quorum: usize,
    pub rw_quorum: usize,
    /// Index of the first entry of the current leadership, 0 when not
    /// leading; gates linearizable reads until it applies.
    pub first_index_of_term: u64,
    pub first_commit_gate: Option<Arc<FirstCommitGate>>,
    pub error: bool,
}

impl RaftStatus {
    #[must_use]
    pub fn new(elect_quorum: usize, rw_quorum: usize) -> Self {
        let now = Instant::now();
        Self {
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
            last_persist_index: 0,
            last_persist_term: 0,
            last_snapshot_index: 0,
            last_snapshot_term: 0,
            lease_end: None,
            last_elect_time: now,
            heartbeat_time: now,
            elect_quorum,
            rw_quorum,
            first_index_of_term: 0,
            first_commit_gate: None,
            error: false,
        }
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self.role, RaftRole::Leader)
    }
}

/// `elect_quorum = n/2 + 1`.
#[must_use]
pub fn elect_quorum(voting_members: usize) -> usize {
    voting_members / 2 + 1
}

/// `rw_quorum = n/2` when `n >= 4` and even, else the elect quorum.
#[must_use]
pub fn rw_quorum(voting_members: usize) -> usize {
    if voting_members >= 4 && voting_members % 2 == 0 {
        voting_members / 2
    } else {
        elect_quorum(voting_members)
    }
}

/// Small randomised addition to the election timeout, derived by hashing
/// the clock so no RNG state is carried around.
#[must_use]
pub fn elect_jitter(max_nanos: u64) -> Duration {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut hasher);
    Duration::from_nanos(hasher.finish() % max_nanos.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_math() {
        assert_eq!(elect_quorum(1), 1);
        assert_eq!(elect_quorum(3), 2);
        assert_eq!(elect_quorum(4), 3);
        assert_eq!(elect_quorum(5), 3);

        assert_eq!(rw_quorum(1), 1);
        assert_eq!(rw_quorum(3), 2);
        assert_eq!(rw_quorum(4), 2);
        assert_eq!(rw_quorum(5), 3);
        assert_eq!(rw_quorum(6), 3);
        assert_eq!(rw_quorum(7), 4);
    }

    #[test]
    fn test_first_commit_gate_completion() {
        let gate = FirstCommitGate::new();
        let waiter = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            waiter.wait_until(Instant::now() + Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(10));
        gate.complete();
        assert!(handle.join().is_ok_and(|r| r.is_ok()));
    }

    #[test]
    fn test_first_commit_gate_timeout() {
        let gate = FirstCommitGate::new();
        let result = gate.wait_until(Instant::now() + Duration::from_millis(20));
        assert!(matches!(result, Err(RaftError::Timeout)));
    }
}
