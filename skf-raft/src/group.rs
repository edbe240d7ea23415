//! One consensus group: state, fibers and lifecycle.
//!
//! Every group runs five kinds of fibers on its dispatcher thread: the
//! main fiber (bootstrap, housekeeping tick, shutdown), the worker fiber
//! (the single log mutator: client proposals and inbound appends), the
//! rpc fiber (ping/vote plus routing), the apply fiber, and per-peer
//! replication and ping fibers. All group state lives in [`GroupCtx`]
//! and is only touched between suspension points, so no locks are held
//! inside a group.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use skf_core::{
    GroupConfig, GroupId, NodeId, RaftError, Result, ServerConfig, Term, parse_member_ids,
};
use skf_fiber::{
    ChannelSender, FiberChannel, FiberCondition, FiberGroup, GroupHandle, IoExecutor, sleep,
};
use skf_store::{RaftLog, StatusManager, StatusRecord};

use crate::codec::{AppendReq, InstallSnapshotReq, RpcResponse};
use crate::member::{self, RaftMember};
use crate::sm::{Snapshot, StateMachine};
use crate::status::{
    FirstCommitGate, GroupShared, RaftRole, RaftStatus, ShareStatus, elect_jitter, elect_quorum,
    rw_quorum,
};
use crate::tail::{RaftTask, TailCache};
use crate::transport::{IncomingRequest, RaftTransport};
use crate::vote::{self, VoteState};
use crate::{apply, engine, snapshot};

/// Housekeeping cadence of the main fiber.
const TICK: Duration = Duration::from_millis(5);
/// Jitter ceiling on the election timeout.
const ELECT_JITTER_NANOS: u64 = 200;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Work items serialised through the single log-mutating fiber.
pub(crate) enum GroupWork {
    Propose(RaftTask),
    Append {
        req: AppendReq,
        reply: skf_fiber::FutureCompleter<RpcResponse>,
    },
    InstallSnapshot {
        req: InstallSnapshotReq,
        reply: skf_fiber::FutureCompleter<RpcResponse>,
    },
    /// Reclamation marker from the snapshot producer: segments holding
    /// only entries at or below `max_index` become deletable.
    MarkTruncateByIndex { max_index: u64, delay_millis: u64 },
    /// Reclamation marker by record age.
    MarkTruncateByTimestamp {
        timestamp_millis: u64,
        delay_millis: u64,
    },
}

pub(crate) struct GroupCtx {
    pub node_id: NodeId,
    pub group_id: GroupId,
    pub observer: bool,
    pub elect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub retry_intervals: Vec<Duration>,
    pub status: RefCell<RaftStatus>,
    pub members: RefCell<Vec<RaftMember>>,
    pub vote: RefCell<VoteState>,
    pub tail: RefCell<TailCache>,
    pub log: RaftLog,
    pub status_mgr: StatusManager,
    pub sm: RefCell<Box<dyn StateMachine>>,
    pub transport: Arc<dyn RaftTransport>,
    pub shared: Arc<GroupShared>,
    pub apply_cond: FiberCondition,
    pub replicate_cond: FiberCondition,
    pub member_cond: FiberCondition,
    pub work: FiberChannel<GroupWork>,
    pub work_tx: ChannelSender<GroupWork>,
    pub rpc: FiberChannel<IncomingRequest>,
    pub ready_gate: Arc<FirstCommitGate>,
    pub group_ready: Cell<bool>,
}

/// Publish a coherent snapshot for lock-free readers.
pub(crate) fn copy_share(ctx: &GroupCtx) {
    let status = ctx.status.borrow();
    ctx.shared.share.store(Arc::new(ShareStatus {
        role: status.role,
        term: status.current_term,
        current_leader: status.current_leader,
        lease_end: status.lease_end,
        last_applied: status.last_applied,
        first_commit_gate: status.first_commit_gate.clone(),
        group_ready: ctx.group_ready.get(),
    }));
}

/// Mark the group failed: reject reads and writes from now on, but keep
/// answering pings so operators can observe it.
pub(crate) fn set_group_error(ctx: &GroupCtx, context: &'static str) {
    skf_core::bug(context);
    ctx.status.borrow_mut().error = true;
    ctx.shared.error.store(true, Ordering::Release);
    let group_id = ctx.group_id;
    ctx.tail
        .borrow_mut()
        .abort_all(|| RaftError::GroupFailed { group_id });
    copy_share(ctx);
    ctx.apply_cond.signal_all();
    ctx.replicate_cond.signal_all();
}

/// Recompute the lease: the rwQuorum-th newest confirm time plus the
/// election timeout. Self counts as confirmed now.
pub(crate) fn update_lease(ctx: &GroupCtx) {
    let mut status = ctx.status.borrow_mut();
    if !status.is_leader() {
        return;
    }
    let members = ctx.members.borrow();
    let mut confirms: Vec<Option<Instant>> = members
        .iter()
        .filter(|m| !m.observer)
        .map(|m| {
            if m.is_self {
                Some(Instant::now())
            } else {
                m.last_confirm
            }
        })
        .collect();
    confirms.sort_by(|a, b| b.cmp(a));
    status.lease_end = confirms
        .get(status.rw_quorum.saturating_sub(1))
        .copied()
        .flatten()
        .map(|t| t + ctx.elect_timeout);
    status.heartbeat_time = Instant::now();
}

pub(crate) async fn persist_status(ctx: &GroupCtx) -> Result<()> {
    let record = {
        let status = ctx.status.borrow();
        StatusRecord {
            current_term: status.current_term,
            voted_for: status.voted_for.unwrap_or(0),
            commit_index: status.commit_index,
        }
    };
    skf_fiber::io_retry(&ctx.retry_intervals, || ctx.status_mgr.persist(record)).await
}

/// Step down (possibly into a higher term). Persists when term or vote
/// changed; aborts a deposed leader's pending proposals.
pub(crate) async fn convert_to_follower(
    ctx: &GroupCtx,
    new_term: Option<Term>,
    leader: Option<NodeId>,
    reset_elect_time: bool,
) -> Result<()> {
    let (was_leader, persist) = {
        let mut status = ctx.status.borrow_mut();
        let was_leader = status.is_leader();
        let mut persist = false;
        if let Some(term) = new_term {
            if term > status.current_term {
                tracing::info!(
                    target: "skiff::raft",
                    group_id = ctx.group_id,
                    old_term = status.current_term,
                    new_term = term,
                    "term advanced, converting to follower"
                );
                status.current_term = term;
                status.voted_for = None;
                persist = true;
            }
        }
        if status.role != RaftRole::Observer {
            status.role = RaftRole::Follower;
        }
        status.current_leader = leader;
        status.lease_end = None;
        if was_leader {
            if let Some(gate) = status.first_commit_gate.take() {
                gate.fail();
            }
            status.first_index_of_term = 0;
        }
        if reset_elect_time {
            status.last_elect_time = Instant::now();
        }
        (was_leader, persist)
    };
    vote::cancel_vote(ctx);
    if was_leader {
        ctx.tail.borrow_mut().abort_all(|| RaftError::NotLeader { leader });
    }
    if persist {
        persist_status(ctx).await?;
    }
    copy_share(ctx);
    ctx.replicate_cond.signal_all();
    Ok(())
}

/// Cross-thread handle to one group, owned by the server.
pub struct RaftGroup {
    pub(crate) group_id: GroupId,
    pub(crate) shared: Arc<GroupShared>,
    pub(crate) handle: GroupHandle,
    pub(crate) work_tx: ChannelSender<GroupWork>,
    pub(crate) rpc_tx: ChannelSender<IncomingRequest>,
    pub(crate) ready_gate: Arc<FirstCommitGate>,
}

impl RaftGroup {
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub(crate) fn spawn(
        server_config: &Arc<ServerConfig>,
        group_config: GroupConfig,
        state_machine: Box<dyn StateMachine>,
        boot_snapshot: Option<Box<dyn Snapshot>>,
        transport: Arc<dyn RaftTransport>,
        handle: GroupHandle,
        io: Arc<IoExecutor>,
    ) -> Result<RaftGroup> {
        let voting_ids = parse_member_ids(&group_config.ids)?;
        let observer_ids = parse_member_ids(&group_config.observer_ids)?;
        let self_votes = voting_ids.contains(&server_config.node_id);
        let self_observes =
            observer_ids.contains(&server_config.node_id) || group_config.observer;
        if !self_votes && !self_observes {
            return Err(RaftError::Config(format!(
                "node {} is in neither ids nor observer_ids of group {}",
                server_config.node_id, group_config.group_id
            )));
        }

        let shared = GroupShared::new();
        let ready_gate = FirstCommitGate::new();
        let (work, work_tx) = FiberChannel::new();
        let (rpc, rpc_tx) = FiberChannel::new();

        let group = RaftGroup {
            group_id: group_config.group_id,
            shared: Arc::clone(&shared),
            handle: handle.clone(),
            work_tx: work_tx.clone(),
            rpc_tx,
            ready_gate: Arc::clone(&ready_gate),
        };

        let config = Arc::clone(server_config);
        let fiber_name = format!("raft-main-{}", group_config.group_id);
        handle.spawn(&fiber_name, false, move || {
            run_main(
                config,
                group_config,
                voting_ids,
                observer_ids,
                state_machine,
                boot_snapshot,
                transport,
                shared,
                ready_gate,
                work,
                work_tx,
                rpc,
                io,
            )
        });
        Ok(group)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_main(
    config: Arc<ServerConfig>,
    group_config: GroupConfig,
    voting_ids: Vec<NodeId>,
    observer_ids: Vec<NodeId>,
    state_machine: Box<dyn StateMachine>,
    boot_snapshot: Option<Box<dyn Snapshot>>,
    transport: Arc<dyn RaftTransport>,
    shared: Arc<GroupShared>,
    ready_gate: Arc<FirstCommitGate>,
    work: FiberChannel<GroupWork>,
    work_tx: ChannelSender<GroupWork>,
    rpc: FiberChannel<IncomingRequest>,
    io: Arc<IoExecutor>,
) -> Result<()> {
    let group_id = group_config.group_id;
    let log = match RaftLog::new(
        &group_config.data_dir,
        group_config.log_file_size,
        group_config.idx_file_size,
        config.max_body_size,
        Arc::clone(&io),
        config.io_retry_interval(),
    ) {
        Ok(log) => log,
        Err(e) => {
            shared.error.store(true, Ordering::Release);
            ready_gate.fail();
            return Err(e);
        }
    };
    let status_mgr = StatusManager::new(group_config.data_dir.join("status"), io);

    let mut members: Vec<RaftMember> = voting_ids
        .iter()
        .map(|id| RaftMember::new(*id, *id == config.node_id, false))
        .collect();
    members.extend(
        observer_ids
            .iter()
            .map(|id| RaftMember::new(*id, *id == config.node_id, true)),
    );
    let observer = observer_ids.contains(&config.node_id) || group_config.observer;

    let eq = elect_quorum(voting_ids.len());
    let rq = rw_quorum(voting_ids.len());
    let mut status = RaftStatus::new(eq, rq);
    if observer {
        status.role = RaftRole::Observer;
    }

    let ctx = Rc::new(GroupCtx {
        node_id: config.node_id,
        group_id,
        observer,
        elect_timeout: config.elect_timeout(),
        heartbeat_interval: config.heartbeat_interval(),
        rpc_timeout: config.rpc_timeout(),
        retry_intervals: config.io_retry_interval(),
        status: RefCell::new(status),
        members: RefCell::new(members),
        vote: RefCell::new(VoteState::default()),
        tail: RefCell::new(TailCache::default()),
        log,
        status_mgr,
        sm: RefCell::new(state_machine),
        transport,
        shared,
        apply_cond: FiberCondition::new(),
        replicate_cond: FiberCondition::new(),
        member_cond: FiberCondition::new(),
        work,
        work_tx,
        rpc,
        ready_gate: Arc::clone(&ready_gate),
        group_ready: Cell::new(false),
    });

    let result = run_group(&ctx, boot_snapshot, &voting_ids).await;
    match result {
        Err(e) if e.is_shutdown() => {
            shutdown_cleanup(&ctx).await;
            Ok(())
        }
        Err(e) => {
            set_group_error(&ctx, "group main fiber failed");
            ctx.ready_gate.fail();
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

async fn run_group(
    ctx: &Rc<GroupCtx>,
    boot_snapshot: Option<Box<dyn Snapshot>>,
    voting_ids: &[NodeId],
) -> Result<()> {
    bootstrap(ctx, boot_snapshot).await?;

    let fiber_group = FiberGroup::current()
        .ok_or_else(|| RaftError::Internal("group fiber outside dispatcher".into()))?;
    let group_id = ctx.group_id;
    fiber_group.spawn(
        format!("raft-worker-{group_id}"),
        engine::run_worker_loop(Rc::clone(ctx)),
    );
    fiber_group.spawn(
        format!("raft-rpc-{group_id}"),
        engine::run_rpc_loop(Rc::clone(ctx)),
    );
    fiber_group.spawn(
        format!("raft-apply-{group_id}"),
        apply::run_apply_loop(Rc::clone(ctx)),
    );
    let peers: Vec<NodeId> = ctx
        .members
        .borrow()
        .iter()
        .filter(|m| !m.is_self)
        .map(|m| m.node_id)
        .collect();
    for peer in peers {
        fiber_group.spawn(
            format!("raft-replicate-{group_id}-{peer}"),
            engine::run_replicate_loop(Rc::clone(ctx), peer),
        );
        fiber_group.spawn_daemon(
            format!("raft-ping-{group_id}-{peer}"),
            member::run_ping_loop(Rc::clone(ctx), peer),
        );
    }

    // Single-node fast path: nothing to wait for, lead immediately.
    let elect_quorum = ctx.status.borrow().elect_quorum;
    if elect_quorum == 1 && !ctx.observer && voting_ids.contains(&ctx.node_id) {
        vote::change_to_leader(ctx, Instant::now());
    } else if elect_quorum > 1 {
        member::wait_members_ready(ctx, elect_quorum).await?;
    }

    ctx.group_ready.set(true);
    ctx.ready_gate.complete();
    copy_share(ctx);
    tracing::info!(target: "skiff::raft", group_id, "group ready");

    run_tick_loop(ctx).await
}

async fn bootstrap(ctx: &Rc<GroupCtx>, boot_snapshot: Option<Box<dyn Snapshot>>) -> Result<()> {
    let record = ctx.status_mgr.init().await?;
    {
        let mut status = ctx.status.borrow_mut();
        status.current_term = record.current_term;
        status.voted_for = (record.voted_for != 0).then_some(record.voted_for);
        status.commit_index = record.commit_index;
    }

    let (snap_term, snap_index) = match boot_snapshot {
        Some(snap) => snapshot::recover_from(ctx, snap)?,
        None => (0, 0),
    };
    {
        let mut status = ctx.status.borrow_mut();
        status.last_applied = snap_index;
        status.last_snapshot_index = snap_index;
        status.last_snapshot_term = snap_term;
        if snap_index > status.commit_index {
            status.commit_index = snap_index;
        }
    }

    let commit_index = ctx.status.borrow().commit_index;
    let (last_term, last_index) = ctx.log.init(commit_index, snap_index).await?;
    {
        let mut status = ctx.status.borrow_mut();
        // An empty log with a snapshot is fine; a log shorter than the
        // snapshot or the committed prefix is data loss.
        let empty_after_snapshot = last_index == 0 && snap_index > 0;
        if !empty_after_snapshot {
            if last_index < snap_index || last_index < status.commit_index {
                return Err(RaftError::Corrupted {
                    offset: 0,
                    reason: format!(
                        "log last index {last_index} below snapshot {snap_index} / commit {}",
                        status.commit_index
                    ),
                });
            }
            if last_term < snap_term {
                return Err(RaftError::Corrupted {
                    offset: 0,
                    reason: format!("log last term {last_term} below snapshot term {snap_term}"),
                });
            }
        }
        if last_index >= snap_index && last_index > 0 {
            status.last_log_index = last_index;
            status.last_log_term = last_term;
        } else {
            status.last_log_index = snap_index;
            status.last_log_term = snap_term;
        }
        status.last_persist_index = status.last_log_index;
        status.last_persist_term = status.last_log_term;
    }
    // Nothing recovered above the snapshot: rebase both queues at the
    // boundary so the first append lands at `snap_index + 1`.
    if last_index == 0 && snap_index > 0 {
        ctx.log.install_snapshot_reset(snap_index).await?;
    }
    let commit_floor = ctx.status.borrow().commit_index;
    ctx.log.set_commit_index(commit_floor);
    {
        // Self starts fully matched.
        let status = ctx.status.borrow();
        let last = status.last_persist_index;
        drop(status);
        member::with_member(ctx, ctx.node_id, |m| {
            m.match_index = last;
            m.next_index = last + 1;
        });
    }
    tracing::info!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        term = ctx.status.borrow().current_term,
        commit_index,
        last_index = ctx.status.borrow().last_log_index,
        "group bootstrapped"
    );
    Ok(())
}

async fn run_tick_loop(ctx: &Rc<GroupCtx>) -> Result<()> {
    loop {
        sleep(TICK).await?;
        let now = Instant::now();
        {
            let last_applied = ctx.status.borrow().last_applied;
            ctx.tail.borrow_mut().clean_pending(last_applied);
        }
        if let Err(e) = ctx.log.do_delete().await {
            if e.is_shutdown() {
                return Err(e);
            }
            tracing::warn!(target: "skiff::raft", group_id = ctx.group_id, "delete round failed: {e}");
        }
        let (role, elect_quorum, last_elect, error) = {
            let status = ctx.status.borrow();
            (
                status.role,
                status.elect_quorum,
                status.last_elect_time,
                status.error,
            )
        };
        if error {
            copy_share(ctx);
            continue;
        }
        if role == RaftRole::Leader {
            update_lease(ctx);
        }
        if elect_quorum > 1
            && matches!(role, RaftRole::Follower | RaftRole::Candidate)
            && now.duration_since(last_elect)
                > ctx.elect_timeout + elect_jitter(ELECT_JITTER_NANOS)
        {
            vote::try_start_pre_vote(ctx);
        }
        copy_share(ctx);
    }
}

async fn shutdown_cleanup(ctx: &Rc<GroupCtx>) {
    tracing::info!(target: "skiff::raft", group_id = ctx.group_id, "group shutting down");
    ctx.ready_gate.fail();
    if let Some(gate) = ctx.status.borrow_mut().first_commit_gate.take() {
        gate.fail();
    }
    ctx.tail.borrow_mut().abort_all(|| RaftError::Stopped);
    if let Err(e) = persist_status(ctx).await {
        tracing::warn!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            "status persist on shutdown failed: {e}"
        );
    }
    if let Err(e) = ctx.sm.borrow_mut().close() {
        tracing::warn!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            "state machine close failed: {e}"
        );
    }
}
