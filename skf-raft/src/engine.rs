//! Replication engine: the single log-mutating worker fiber, the rpc
//! routing fiber, and one replication fiber per peer.

use std::rc::Rc;
use std::time::Instant;

use skf_core::{NodeId, RaftError, Result, Term};
use skf_fiber::{FutureCompleter, sleep, with_deadline};
use skf_store::LogItem;

use crate::codec::{AppendReq, AppendResp, PingResp, RpcRequest, RpcResponse};
use crate::group::{
    GroupCtx, GroupWork, convert_to_follower, copy_share, now_millis, set_group_error,
    update_lease,
};
use crate::member::with_member;
use crate::tail::RaftTask;
use crate::{commit, snapshot, vote};

/// Max proposals folded into one log append.
const PROPOSAL_BATCH: usize = 128;
/// Per-request replication batch bounds.
const REPL_LOAD_LIMIT: usize = 64;
const REPL_LOAD_BYTES: usize = 1024 * 1024;

/// Term of `index` as the leader knows it, using the cheap paths before
/// touching the log.
pub(crate) async fn term_of(ctx: &Rc<GroupCtx>, index: u64) -> Result<Term> {
    if index == 0 {
        return Ok(0);
    }
    {
        let status = ctx.status.borrow();
        if index == status.last_persist_index {
            return Ok(status.last_persist_term);
        }
        if index == status.last_snapshot_index {
            return Ok(status.last_snapshot_term);
        }
        if index < status.last_snapshot_index {
            // Covered by the snapshot; by leader completeness it matched.
            return Ok(status.last_snapshot_term);
        }
    }
    ctx.log.term_at(index).await
}

// ---------------------------------------------------------------------
// Worker fiber: proposals and inbound appends, strictly serialised.
// ---------------------------------------------------------------------

pub(crate) async fn run_worker_loop(ctx: Rc<GroupCtx>) -> Result<()> {
    loop {
        let first = ctx.work.recv().await?;
        match first {
            GroupWork::Propose(task) => {
                let mut batch = vec![task];
                let mut deferred = None;
                while batch.len() < PROPOSAL_BATCH {
                    match ctx.work.try_recv() {
                        Some(GroupWork::Propose(t)) => batch.push(t),
                        Some(other) => {
                            deferred = Some(other);
                            break;
                        }
                        None => break,
                    }
                }
                handle_proposals(&ctx, batch).await?;
                if let Some(work) = deferred {
                    dispatch_work(&ctx, work).await?;
                }
            }
            other => dispatch_work(&ctx, other).await?,
        }
    }
}

async fn dispatch_work(ctx: &Rc<GroupCtx>, work: GroupWork) -> Result<()> {
    match work {
        GroupWork::Propose(task) => handle_proposals(ctx, vec![task]).await,
        GroupWork::Append { req, reply } => handle_append(ctx, req, reply).await,
        GroupWork::InstallSnapshot { req, reply } => {
            snapshot::handle_install(ctx, req, reply).await
        }
        GroupWork::MarkTruncateByIndex {
            max_index,
            delay_millis,
        } => {
            let commit = ctx.status.borrow().commit_index;
            if let Err(e) = ctx
                .log
                .mark_truncate_by_index(max_index, commit, delay_millis)
                .await
            {
                if e.is_shutdown() {
                    return Err(e);
                }
                tracing::warn!(
                    target: "skiff::raft",
                    group_id = ctx.group_id,
                    "truncate marker failed: {e}"
                );
            }
            run_delete_round(ctx).await
        }
        GroupWork::MarkTruncateByTimestamp {
            timestamp_millis,
            delay_millis,
        } => {
            let commit = ctx.status.borrow().commit_index;
            if let Err(e) = ctx
                .log
                .mark_truncate_by_timestamp(commit, timestamp_millis, delay_millis)
                .await
            {
                if e.is_shutdown() {
                    return Err(e);
                }
                tracing::warn!(
                    target: "skiff::raft",
                    group_id = ctx.group_id,
                    "truncate marker failed: {e}"
                );
            }
            run_delete_round(ctx).await
        }
    }
}

async fn run_delete_round(ctx: &Rc<GroupCtx>) -> Result<()> {
    match ctx.log.do_delete_now().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_shutdown() => Err(e),
        Err(e) => {
            tracing::warn!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                "delete round failed: {e}"
            );
            Ok(())
        }
    }
}

async fn handle_proposals(ctx: &Rc<GroupCtx>, tasks: Vec<RaftTask>) -> Result<()> {
    {
        let status = ctx.status.borrow();
        if status.error {
            let group_id = ctx.group_id;
            drop(status);
            for task in tasks {
                task.finish(Err(RaftError::GroupFailed { group_id }));
            }
            return Ok(());
        }
        if !status.is_leader() {
            let leader = status.current_leader;
            drop(status);
            for task in tasks {
                task.finish(Err(RaftError::NotLeader { leader }));
            }
            return Ok(());
        }
    }

    let mut items = Vec::with_capacity(tasks.len());
    {
        let mut status = ctx.status.borrow_mut();
        let mut tail = ctx.tail.borrow_mut();
        for mut task in tasks {
            let index = status.last_log_index + 1;
            items.push(LogItem {
                index,
                term: status.current_term,
                prev_log_term: status.last_log_term,
                timestamp: now_millis(),
                item_type: task.item_type,
                biz_type: task.input.biz_type,
                header: task.input.header.clone(),
                body: task.input.body.clone(),
            });
            task.term = status.current_term;
            tail.insert(index, task);
            status.last_log_index = index;
            status.last_log_term = status.current_term;
            if status.first_index_of_term == 0 {
                status.first_index_of_term = index;
            }
        }
    }

    match ctx.log.append(items).await {
        Ok(()) => {
            let last_persist = {
                let mut status = ctx.status.borrow_mut();
                status.last_persist_index = status.last_log_index;
                status.last_persist_term = status.last_log_term;
                status.last_persist_index
            };
            with_member(ctx, ctx.node_id, |m| {
                m.match_index = last_persist;
                m.next_index = last_persist + 1;
            });
            commit::try_advance(ctx).await?;
            ctx.replicate_cond.signal_all();
            Ok(())
        }
        Err(e) if e.is_shutdown() => Err(e),
        Err(e) => {
            tracing::error!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                "leader log append failed: {e}"
            );
            set_group_error(ctx, "leader log append failed");
            Ok(())
        }
    }
}

async fn handle_append(
    ctx: &Rc<GroupCtx>,
    req: AppendReq,
    reply: FutureCompleter<RpcResponse>,
) -> Result<()> {
    match do_handle_append(ctx, req).await {
        Ok(resp) => {
            reply.complete(Ok(RpcResponse::Append(resp)));
            Ok(())
        }
        Err(e) if e.is_shutdown() => {
            reply.complete(Err(RaftError::Stopped));
            Err(e)
        }
        Err(e) => {
            tracing::error!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                "append handling failed: {e}"
            );
            set_group_error(ctx, "append handling failed");
            reply.complete(Err(RaftError::GroupFailed {
                group_id: ctx.group_id,
            }));
            Ok(())
        }
    }
}

async fn do_handle_append(ctx: &Rc<GroupCtx>, req: AppendReq) -> Result<AppendResp> {
    {
        let status = ctx.status.borrow();
        if req.term < status.current_term {
            return Ok(AppendResp {
                term: status.current_term,
                success: false,
                suggested_next_index: 0,
            });
        }
    }
    // A valid current-term leader exists: adopt it.
    convert_to_follower(ctx, Some(req.term), Some(req.leader_id), true).await?;

    let (last_persist, snap_index, commit) = {
        let status = ctx.status.borrow();
        (
            status.last_persist_index,
            status.last_snapshot_index,
            status.commit_index,
        )
    };
    let current_term = ctx.status.borrow().current_term;

    // Consistency check on the previous entry.
    let prev_ok = if req.prev_log_index == 0 || req.prev_log_index <= snap_index {
        true
    } else if req.prev_log_index > last_persist {
        false
    } else {
        match term_of(ctx, req.prev_log_index).await {
            Ok(term) => term == req.prev_log_term,
            Err(e) if e.is_shutdown() => return Err(e),
            Err(_) => false,
        }
    };
    if !prev_ok {
        let suggested = if req.prev_log_index > last_persist {
            last_persist + 1
        } else {
            // Never retreat below the committed prefix.
            commit + 1
        };
        tracing::info!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            prev_log_index = req.prev_log_index,
            suggested,
            "append consistency check failed"
        );
        return Ok(AppendResp {
            term: current_term,
            success: false,
            suggested_next_index: suggested,
        });
    }

    if !req.entries.is_empty() {
        // Entries at or below the commit/snapshot line are identical by
        // leader completeness; skip them.
        let floor = commit.max(snap_index);
        let effective: Vec<LogItem> = req
            .entries
            .into_iter()
            .filter(|e| e.index > floor)
            .collect();
        if let Some(first) = effective.first().map(|e| e.index) {
            let (last_index, last_term) = effective
                .last()
                .map(|e| (e.index, e.term))
                .unwrap_or_default();
            {
                let status = ctx.status.borrow();
                if first <= status.last_log_index {
                    // Overwriting a divergent tail aborts any proposals a
                    // deposed leader still had pending there.
                    drop(status);
                    ctx.tail
                        .borrow_mut()
                        .abort_from(first, Some(req.leader_id));
                }
            }
            ctx.log.append(effective).await?;
            let mut status = ctx.status.borrow_mut();
            status.last_log_index = last_index;
            status.last_log_term = last_term;
            status.last_persist_index = last_index;
            status.last_persist_term = last_term;
        }
    }

    // Follower commit advance.
    {
        let mut status = ctx.status.borrow_mut();
        let new_commit = req.leader_commit.min(status.last_persist_index);
        if new_commit > status.commit_index {
            status.commit_index = new_commit;
            drop(status);
            ctx.log.set_commit_index(new_commit);
            ctx.apply_cond.signal_all();
        }
    }
    Ok(AppendResp {
        term: current_term,
        success: true,
        suggested_next_index: 0,
    })
}

// ---------------------------------------------------------------------
// RPC routing fiber.
// ---------------------------------------------------------------------

pub(crate) async fn run_rpc_loop(ctx: Rc<GroupCtx>) -> Result<()> {
    loop {
        let incoming = ctx.rpc.recv().await?;
        match incoming.request {
            RpcRequest::Ping(_) => {
                incoming.reply.complete(Ok(RpcResponse::Ping(PingResp {
                    node_id: ctx.node_id,
                    group_ready: ctx.group_ready.get(),
                })));
            }
            RpcRequest::Vote(req) => match vote::handle_vote_request(&ctx, &req).await {
                Ok(resp) => incoming.reply.complete(Ok(RpcResponse::Vote(resp))),
                Err(e) if e.is_shutdown() => {
                    incoming.reply.complete(Err(RaftError::Stopped));
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(
                        target: "skiff::raft",
                        group_id = ctx.group_id,
                        "vote handling failed: {e}"
                    );
                    incoming.reply.complete(Err(RaftError::GroupFailed {
                        group_id: ctx.group_id,
                    }));
                }
            },
            RpcRequest::Append(req) => {
                ctx.work_tx.send(GroupWork::Append {
                    req,
                    reply: incoming.reply,
                });
            }
            RpcRequest::InstallSnapshot(req) => {
                ctx.work_tx.send(GroupWork::InstallSnapshot {
                    req,
                    reply: incoming.reply,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------
// Per-peer replication fiber.
// ---------------------------------------------------------------------

pub(crate) async fn run_replicate_loop(ctx: Rc<GroupCtx>, peer: NodeId) -> Result<()> {
    let mut last_send = Instant::now();
    loop {
        let (is_leader, error) = {
            let status = ctx.status.borrow();
            (status.is_leader(), status.error)
        };
        if !is_leader || error {
            ctx.replicate_cond.wait().await?;
            last_send = Instant::now();
            continue;
        }
        let Some((ready, installing, next_index)) = with_member(&ctx, peer, |m| {
            (m.ready, m.installing_snapshot, m.next_index)
        }) else {
            skf_core::bug("replication fiber for unknown member");
            return Ok(());
        };
        if !ready {
            wait_or_timeout(&ctx, Instant::now() + ctx.heartbeat_interval).await?;
            continue;
        }
        if installing {
            snapshot::replicate_snapshot(&ctx, peer).await?;
            continue;
        }
        let (term, last_persist, last_persist_term, leader_commit) = {
            let status = ctx.status.borrow();
            (
                status.current_term,
                status.last_persist_index,
                status.last_persist_term,
                status.commit_index,
            )
        };
        if next_index <= last_persist {
            let items = match ctx.log.load(next_index, REPL_LOAD_LIMIT, REPL_LOAD_BYTES).await {
                Ok(items) => items,
                Err(e) if e.is_shutdown() => return Err(e),
                Err(_) => {
                    // The prefix was reclaimed; ship a snapshot instead.
                    tracing::info!(
                        target: "skiff::raft",
                        group_id = ctx.group_id,
                        peer,
                        next_index,
                        "switching peer to snapshot install"
                    );
                    with_member(&ctx, peer, |m| m.installing_snapshot = true);
                    continue;
                }
            };
            let prev_log_index = next_index - 1;
            let prev_log_term = match term_of(&ctx, prev_log_index).await {
                Ok(term) => term,
                Err(e) if e.is_shutdown() => return Err(e),
                Err(_) => {
                    with_member(&ctx, peer, |m| m.installing_snapshot = true);
                    continue;
                }
            };
            let last_sent = items.last().map_or(prev_log_index, |i| i.index);
            let req = AppendReq {
                group_id: ctx.group_id,
                term,
                leader_id: ctx.node_id,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries: items,
            };
            let send_time = Instant::now();
            last_send = send_time;
            let resp = with_deadline(
                ctx.transport.send(peer, RpcRequest::Append(req)),
                send_time + ctx.rpc_timeout,
            )
            .await;
            process_append_resp(&ctx, peer, term, last_sent, send_time, resp).await?;
        } else {
            let heartbeat_at = last_send + ctx.heartbeat_interval;
            if Instant::now() < heartbeat_at {
                wait_or_timeout(&ctx, heartbeat_at).await?;
                continue;
            }
            let req = AppendReq {
                group_id: ctx.group_id,
                term,
                leader_id: ctx.node_id,
                prev_log_index: last_persist,
                prev_log_term: last_persist_term,
                leader_commit,
                entries: Vec::new(),
            };
            let send_time = Instant::now();
            last_send = send_time;
            let resp = with_deadline(
                ctx.transport.send(peer, RpcRequest::Append(req)),
                send_time + ctx.rpc_timeout,
            )
            .await;
            process_append_resp(&ctx, peer, term, last_persist, send_time, resp).await?;
        }
    }
}

async fn wait_or_timeout(ctx: &Rc<GroupCtx>, deadline: Instant) -> Result<()> {
    match ctx.replicate_cond.wait_deadline(deadline).await {
        Ok(()) | Err(RaftError::Timeout) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn process_append_resp(
    ctx: &Rc<GroupCtx>,
    peer: NodeId,
    sent_term: Term,
    last_sent_index: u64,
    send_time: Instant,
    resp: Result<RpcResponse>,
) -> Result<()> {
    let resp = match resp {
        Ok(RpcResponse::Append(resp)) => resp,
        Ok(_) => {
            skf_core::bug("append rpc answered with wrong response type");
            return Ok(());
        }
        Err(e) if e.is_shutdown() => return Err(e),
        Err(e) => {
            tracing::debug!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                peer,
                "append rpc failed: {e}"
            );
            // Back off instead of hammering an unreachable peer.
            sleep(ctx.heartbeat_interval).await?;
            return Ok(());
        }
    };
    {
        let status = ctx.status.borrow();
        if !status.is_leader() || status.current_term != sent_term {
            return Ok(());
        }
    }
    if resp.term > sent_term {
        convert_to_follower(ctx, Some(resp.term), None, true).await?;
        return Ok(());
    }
    if resp.success {
        with_member(ctx, peer, |m| {
            if last_sent_index > m.match_index {
                m.match_index = last_sent_index;
            }
            m.next_index = m.match_index + 1;
            m.last_confirm = Some(send_time);
        });
        update_lease(ctx);
        commit::try_advance(ctx).await?;
        copy_share(ctx);
    } else {
        let last_log_index = ctx.status.borrow().last_log_index;
        with_member(ctx, peer, |m| {
            if resp.suggested_next_index > 0 {
                m.next_index = resp.suggested_next_index.clamp(1, last_log_index + 1);
            } else if m.next_index > 1 {
                m.next_index -= 1;
            }
        });
    }
    Ok(())
}
