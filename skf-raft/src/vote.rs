//! Election: pre-vote probe, real vote, and the responder side.
//!
//! Pre-vote reuses the vote RPC with `pre_vote = true` and term
//! `current + 1`, without touching local term or `voted_for`. Every
//! round carries a monotonic vote id; responses from an older round are
//! dropped. Starting a pre-vote pushes `last_elect_time` forward one
//! second so a failed probe does not retrigger immediately.

use std::collections::HashSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use skf_core::{NodeId, Result};
use skf_fiber::{FiberGroup, with_deadline};

use crate::codec::{RpcRequest, RpcResponse, VoteReq, VoteResp};
use crate::group::{GroupCtx, GroupWork, convert_to_follower, copy_share, persist_status, update_lease};
use crate::member::{ready_voting_count, with_member};
use crate::status::RaftRole;
use crate::tail::RaftTask;

#[derive(Default)]
pub(crate) struct VoteState {
    voting: bool,
    votes: HashSet<NodeId>,
    vote_id: u64,
    pending: usize,
}

pub(crate) fn cancel_vote(ctx: &GroupCtx) {
    let mut vote = ctx.vote.borrow_mut();
    if vote.voting {
        tracing::info!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            vote_id = vote.vote_id,
            "cancelling vote round"
        );
        vote.voting = false;
        vote.votes.clear();
        vote.vote_id += 1;
        vote.pending = 0;
    }
}

fn init_voting(ctx: &GroupCtx, fanout: usize) -> u64 {
    let mut vote = ctx.vote.borrow_mut();
    vote.voting = true;
    vote.vote_id += 1;
    vote.votes.clear();
    vote.votes.insert(ctx.node_id);
    vote.pending = fanout;
    vote.vote_id
}

fn desc_pending(ctx: &GroupCtx, vote_id: u64) {
    let mut vote = ctx.vote.borrow_mut();
    if vote.vote_id != vote_id || !vote.voting {
        return;
    }
    vote.pending = vote.pending.saturating_sub(1);
    if vote.pending == 0 {
        vote.voting = false;
        vote.votes.clear();
    }
}

/// Candidate log at least as up to date as ours (§5.4.1: terms first,
/// then indexes).
fn log_up_to_date(ctx: &GroupCtx, last_log_term: u32, last_log_index: u64) -> bool {
    let status = ctx.status.borrow();
    (last_log_term, last_log_index) >= (status.last_log_term, status.last_log_index)
}

/// Election-timeout hook from the main fiber.
pub(crate) fn try_start_pre_vote(ctx: &Rc<GroupCtx>) {
    if ctx.observer || ctx.vote.borrow().voting {
        return;
    }
    // Push the elect time forward so a failed probe backs off.
    {
        let mut status = ctx.status.borrow_mut();
        status.last_elect_time += Duration::from_secs(1);
    }
    let count = ready_voting_count(ctx);
    let (elect_quorum, term) = {
        let status = ctx.status.borrow();
        (status.elect_quorum, status.current_term)
    };
    if count < elect_quorum {
        tracing::warn!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            ready = count,
            elect_quorum,
            "not enough ready members for pre-vote"
        );
        return;
    }
    let vote_id = init_voting(ctx, count - 1);
    tracing::info!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        term,
        vote_id,
        ready = count,
        "starting pre-vote"
    );
    fan_out(ctx, true, Instant::now());
}

fn fan_out(ctx: &Rc<GroupCtx>, pre_vote: bool, lease_start: Instant) {
    let Some(fiber_group) = FiberGroup::current() else {
        return;
    };
    let peers: Vec<NodeId> = ctx
        .members
        .borrow()
        .iter()
        .filter(|m| !m.is_self && !m.observer && m.ready)
        .map(|m| m.node_id)
        .collect();
    for peer in peers {
        let ctx = Rc::clone(ctx);
        let kind = if pre_vote { "pre-vote" } else { "vote" };
        fiber_group.spawn(
            format!("raft-{kind}-{}-{peer}", ctx.group_id),
            send_vote_rpc(ctx, peer, pre_vote, lease_start),
        );
    }
}

async fn send_vote_rpc(
    ctx: Rc<GroupCtx>,
    peer: NodeId,
    pre_vote: bool,
    lease_start: Instant,
) -> Result<()> {
    let vote_id = ctx.vote.borrow().vote_id;
    let req = {
        let status = ctx.status.borrow();
        VoteReq {
            group_id: ctx.group_id,
            term: if pre_vote {
                status.current_term + 1
            } else {
                status.current_term
            },
            candidate_id: ctx.node_id,
            last_log_index: status.last_log_index,
            last_log_term: status.last_log_term,
            pre_vote,
        }
    };
    tracing::info!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        peer,
        term = req.term,
        pre_vote,
        "sending vote request"
    );
    let deadline = Instant::now() + ctx.rpc_timeout;
    let resp = with_deadline(ctx.transport.send(peer, RpcRequest::Vote(req.clone())), deadline)
        .await;
    if ctx.vote.borrow().vote_id != vote_id {
        return Ok(());
    }
    match resp {
        Ok(RpcResponse::Vote(resp)) => {
            if pre_vote {
                process_pre_vote_resp(&ctx, peer, &req, &resp).await?;
            } else {
                process_vote_resp(&ctx, peer, &req, &resp, lease_start).await?;
            }
        }
        Ok(_) => {
            skf_core::bug("vote rpc answered with wrong response type");
        }
        Err(e) => {
            // No retry; the next election timeout covers it.
            tracing::warn!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                peer,
                pre_vote,
                "vote rpc failed: {e}"
            );
        }
    }
    desc_pending(&ctx, vote_id);
    Ok(())
}

async fn process_pre_vote_resp(
    ctx: &Rc<GroupCtx>,
    peer: NodeId,
    req: &VoteReq,
    resp: &VoteResp,
) -> Result<()> {
    let (role, elect_quorum) = {
        let status = ctx.status.borrow();
        (status.role, status.elect_quorum)
    };
    if resp.vote_granted && role == RaftRole::Follower && resp.term == req.term {
        let reached = {
            let mut vote = ctx.vote.borrow_mut();
            let before = vote.votes.len();
            vote.votes.insert(peer);
            vote.votes.len() > before && vote.votes.len() == elect_quorum
        };
        if reached {
            tracing::info!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                "pre-vote succeeded, starting election"
            );
            start_vote(ctx).await?;
        }
    } else {
        tracing::info!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            peer,
            granted = resp.vote_granted,
            "pre-vote not granted"
        );
    }
    Ok(())
}

/// Pre-vote carried: increment the term, vote for self, persist, then
/// fan the real vote out.
async fn start_vote(ctx: &Rc<GroupCtx>) -> Result<()> {
    let elect_quorum = ctx.status.borrow().elect_quorum;
    let count = ready_voting_count(ctx);
    if count < elect_quorum {
        tracing::warn!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            ready = count,
            "lost readiness before vote"
        );
        return Ok(());
    }
    let voting_peers = {
        let members = ctx.members.borrow();
        members.iter().filter(|m| !m.is_self && !m.observer).count()
    };
    let lease_start = Instant::now();
    {
        let mut status = ctx.status.borrow_mut();
        if status.role != RaftRole::Candidate {
            tracing::info!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                term = status.current_term,
                "becoming candidate"
            );
            status.role = RaftRole::Candidate;
        }
        status.current_leader = None;
        status.lease_end = None;
        status.current_term += 1;
        status.voted_for = Some(ctx.node_id);
        status.last_elect_time = lease_start;
    }
    init_voting(ctx, voting_peers);
    persist_status(ctx).await?;
    {
        let vote = ctx.vote.borrow();
        tracing::info!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            term = ctx.status.borrow().current_term,
            vote_id = vote.vote_id,
            "starting vote"
        );
    }
    with_member(ctx, ctx.node_id, |m| m.last_confirm = Some(lease_start));
    // Non-ready peers count as already-answered rejections.
    let not_ready = {
        let members = ctx.members.borrow();
        members
            .iter()
            .filter(|m| !m.is_self && !m.observer && !m.ready)
            .count()
    };
    let vote_id = ctx.vote.borrow().vote_id;
    for _ in 0..not_ready {
        desc_pending(ctx, vote_id);
    }
    fan_out(ctx, false, lease_start);
    copy_share(ctx);
    Ok(())
}

async fn process_vote_resp(
    ctx: &Rc<GroupCtx>,
    peer: NodeId,
    req: &VoteReq,
    resp: &VoteResp,
    lease_start: Instant,
) -> Result<()> {
    let (current_term, role, elect_quorum) = {
        let status = ctx.status.borrow();
        (status.current_term, status.role, status.elect_quorum)
    };
    if resp.term < current_term {
        tracing::warn!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            peer,
            resp_term = resp.term,
            req_term = req.term,
            "dropping outdated vote response"
        );
    } else if resp.term == current_term {
        if role != RaftRole::Candidate {
            tracing::warn!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                peer,
                "vote response while not candidate"
            );
        } else if resp.vote_granted {
            with_member(ctx, peer, |m| m.last_confirm = Some(lease_start));
            let won = {
                let mut vote = ctx.vote.borrow_mut();
                let before = vote.votes.len();
                vote.votes.insert(peer);
                vote.votes.len() > before && vote.votes.len() == elect_quorum
            };
            if won {
                change_to_leader(ctx, lease_start);
            }
        }
    } else {
        convert_to_follower(ctx, Some(resp.term), None, true).await?;
    }
    Ok(())
}

/// Won the election (or single-node fast path): seed per-peer indexes,
/// arm the first-commit gate and propose the term's no-op entry.
pub(crate) fn change_to_leader(ctx: &Rc<GroupCtx>, lease_start: Instant) {
    let (term, next_index) = {
        let mut status = ctx.status.borrow_mut();
        status.role = RaftRole::Leader;
        status.current_leader = Some(ctx.node_id);
        status.first_index_of_term = 0;
        status.first_commit_gate = Some(crate::status::FirstCommitGate::new());
        (status.current_term, status.last_log_index + 1)
    };
    {
        let last_persist = ctx.status.borrow().last_persist_index;
        let mut members = ctx.members.borrow_mut();
        for m in members.iter_mut() {
            if m.is_self {
                m.match_index = last_persist;
                m.next_index = last_persist + 1;
                m.last_confirm = Some(lease_start);
            } else {
                m.match_index = 0;
                m.next_index = next_index;
                m.installing_snapshot = false;
            }
        }
    }
    cancel_vote(ctx);
    update_lease(ctx);
    tracing::info!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        term,
        "became leader"
    );
    // The no-op seals leader completeness for the new term.
    ctx.work_tx.send(GroupWork::Propose(RaftTask::noop()));
    copy_share(ctx);
    ctx.replicate_cond.signal_all();
}

/// Responder side of `RAFT_REQUEST_VOTE`.
pub(crate) async fn handle_vote_request(ctx: &Rc<GroupCtx>, req: &VoteReq) -> Result<VoteResp> {
    if ctx.observer || ctx.status.borrow().error {
        let term = ctx.status.borrow().current_term;
        return Ok(VoteResp {
            term,
            vote_granted: false,
        });
    }
    if req.pre_vote {
        let (term, leader_active) = {
            let status = ctx.status.borrow();
            let active = status.current_leader.is_some()
                && Instant::now().duration_since(status.last_elect_time) < ctx.elect_timeout;
            (status.current_term, active)
        };
        let granted = !leader_active
            && req.term >= term
            && log_up_to_date(ctx, req.last_log_term, req.last_log_index);
        tracing::info!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            candidate = req.candidate_id,
            granted,
            "pre-vote request"
        );
        return Ok(VoteResp {
            term,
            vote_granted: granted,
        });
    }

    if req.term > ctx.status.borrow().current_term {
        convert_to_follower(ctx, Some(req.term), None, false).await?;
    }
    let current_term = ctx.status.borrow().current_term;
    if req.term < current_term {
        return Ok(VoteResp {
            term: current_term,
            vote_granted: false,
        });
    }
    let can_vote = {
        let status = ctx.status.borrow();
        status.voted_for.is_none() || status.voted_for == Some(req.candidate_id)
    };
    let granted = can_vote && log_up_to_date(ctx, req.last_log_term, req.last_log_index);
    if granted {
        {
            let mut status = ctx.status.borrow_mut();
            status.voted_for = Some(req.candidate_id);
            status.last_elect_time = Instant::now();
        }
        persist_status(ctx).await?;
        copy_share(ctx);
    }
    tracing::info!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        candidate = req.candidate_id,
        term = req.term,
        granted,
        "vote request"
    );
    Ok(VoteResp {
        term: current_term,
        vote_granted: granted,
    })
}
