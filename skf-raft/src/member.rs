//! Peer bookkeeping and liveness.
//!
//! Each peer gets a daemon ping fiber driving `RAFT_PING`; `ready`
//! transitions are idempotent and wake anyone blocked on the member
//! condition. Non-ready peers are skipped by vote and replication
//! fan-out but still count in quorum size.

use std::rc::Rc;
use std::time::Instant;

use skf_core::{NodeId, Result};
use skf_fiber::{sleep, with_deadline};

use crate::codec::{PingReq, RpcRequest, RpcResponse};
use crate::group::GroupCtx;

pub struct RaftMember {
    pub node_id: NodeId,
    pub is_self: bool,
    pub observer: bool,
    /// Last `RAFT_PING` round trip succeeded.
    pub ready: bool,
    /// Highest index known replicated on this member, monotonic within
    /// a term.
    pub match_index: u64,
    pub next_index: u64,
    /// Send time of the last confirmed request; feeds the lease.
    pub last_confirm: Option<Instant>,
    pub installing_snapshot: bool,
}

impl RaftMember {
    #[must_use]
    pub fn new(node_id: NodeId, is_self: bool, observer: bool) -> Self {
        Self {
            node_id,
            is_self,
            observer,
            ready: is_self,
            match_index: 0,
            next_index: 1,
            last_confirm: None,
            installing_snapshot: false,
        }
    }
}

/// Ready members that count toward quorums (observers excluded, self
/// included).
pub(crate) fn ready_voting_count(ctx: &GroupCtx) -> usize {
    ctx.members
        .borrow()
        .iter()
        .filter(|m| !m.observer && m.ready)
        .count()
}

pub(crate) fn with_member<R>(
    ctx: &GroupCtx,
    node_id: NodeId,
    f: impl FnOnce(&mut RaftMember) -> R,
) -> Option<R> {
    ctx.members
        .borrow_mut()
        .iter_mut()
        .find(|m| m.node_id == node_id)
        .map(f)
}

/// Block until `n` voting members (self included) are ready.
pub(crate) async fn wait_members_ready(ctx: &Rc<GroupCtx>, n: usize) -> Result<()> {
    loop {
        if ready_voting_count(ctx) >= n {
            return Ok(());
        }
        ctx.member_cond.wait().await?;
    }
}

/// Daemon fiber: ping one peer forever, tracking readiness.
pub(crate) async fn run_ping_loop(ctx: Rc<GroupCtx>, peer: NodeId) -> Result<()> {
    loop {
        let req = RpcRequest::Ping(PingReq {
            group_id: ctx.group_id,
            node_id: ctx.node_id,
        });
        let deadline = Instant::now() + ctx.rpc_timeout;
        let resp = with_deadline(ctx.transport.send(peer, req), deadline).await;
        let ok = matches!(&resp, Ok(RpcResponse::Ping(p)) if p.node_id == peer);
        let changed = with_member(&ctx, peer, |m| {
            let changed = m.ready != ok;
            m.ready = ok;
            changed
        })
        .unwrap_or(false);
        if changed {
            tracing::info!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                peer,
                ready = ok,
                "member ready changed"
            );
            ctx.member_cond.signal_all();
            ctx.replicate_cond.signal_all();
        }
        sleep(ctx.heartbeat_interval).await?;
    }
}
