//! Snapshot install: boot-time restore, the follower-side protocol, and
//! the leader-side streaming to a peer whose prefix was reclaimed.

use std::rc::Rc;
use std::time::Instant;

use skf_core::{NodeId, RaftError, Result, Term};
use skf_fiber::{FutureCompleter, with_deadline};

use crate::codec::{InstallSnapshotReq, InstallSnapshotResp, RpcRequest, RpcResponse};
use crate::group::{
    GroupCtx, convert_to_follower, copy_share, persist_status, set_group_error, update_lease,
};
use crate::member::with_member;
use crate::sm::Snapshot;

/// Feed a locally stored snapshot into the state machine at boot.
/// Returns the `(term, index)` the snapshot covers.
pub(crate) fn recover_from(
    ctx: &Rc<GroupCtx>,
    mut snapshot: Box<dyn Snapshot>,
) -> Result<(Term, u64)> {
    let last_index = snapshot.last_included_index();
    let last_term = snapshot.last_included_term();
    let mut offset = 0u64;
    let mut sm = ctx.sm.borrow_mut();
    loop {
        match snapshot.read_next()? {
            Some(chunk) => {
                sm.install_snapshot(last_index, last_term, offset, false, &chunk)?;
                offset += chunk.len() as u64;
            }
            None => {
                sm.install_snapshot(last_index, last_term, offset, true, &[])?;
                break;
            }
        }
    }
    tracing::info!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        last_index,
        last_term,
        bytes = offset,
        "state machine recovered from snapshot"
    );
    Ok((last_term, last_index))
}

/// Follower side of `RAFT_INSTALL_SNAPSHOT`, serialised through the
/// worker fiber.
pub(crate) async fn handle_install(
    ctx: &Rc<GroupCtx>,
    req: InstallSnapshotReq,
    reply: FutureCompleter<RpcResponse>,
) -> Result<()> {
    match do_handle_install(ctx, req).await {
        Ok(resp) => {
            reply.complete(Ok(RpcResponse::InstallSnapshot(resp)));
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
                "snapshot install failed: {e}"
            );
            set_group_error(ctx, "snapshot install failed");
            reply.complete(Err(RaftError::GroupFailed {
                group_id: ctx.group_id,
            }));
            Ok(())
        }
    }
}

async fn do_handle_install(
    ctx: &Rc<GroupCtx>,
    req: InstallSnapshotReq,
) -> Result<InstallSnapshotResp> {
    {
        let status = ctx.status.borrow();
        if req.term < status.current_term {
            return Ok(InstallSnapshotResp {
                term: status.current_term,
                success: false,
            });
        }
    }
    convert_to_follower(ctx, Some(req.term), Some(req.leader_id), true).await?;
    let current_term = ctx.status.borrow().current_term;

    // The final chunk is flagged done or carries an empty body.
    let done = req.done || req.data.is_empty();
    ctx.sm.borrow_mut().install_snapshot(
        req.last_included_index,
        req.last_included_term,
        req.offset,
        done,
        &req.data,
    )?;

    if done {
        let last_index = req.last_included_index;
        {
            let mut status = ctx.status.borrow_mut();
            status.last_applied = status.last_applied.max(last_index);
            status.commit_index = status.commit_index.max(last_index);
            status.last_snapshot_index = last_index;
            status.last_snapshot_term = req.last_included_term;
            status.last_log_index = last_index;
            status.last_log_term = req.last_included_term;
            status.last_persist_index = last_index;
            status.last_persist_term = req.last_included_term;
        }
        ctx.log.install_snapshot_reset(last_index).await?;
        let commit = ctx.status.borrow().commit_index;
        ctx.log.set_commit_index(commit);
        persist_status(ctx).await?;
        with_member(ctx, ctx.node_id, |m| {
            m.match_index = last_index;
            m.next_index = last_index + 1;
        });
        ctx.apply_cond.signal_all();
        copy_share(ctx);
        tracing::info!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            last_index,
            "snapshot installed"
        );
    }
    Ok(InstallSnapshotResp {
        term: current_term,
        success: true,
    })
}

/// Leader side: stream the state machine's snapshot to one peer, then
/// resume log replication after the boundary.
pub(crate) async fn replicate_snapshot(ctx: &Rc<GroupCtx>, peer: NodeId) -> Result<()> {
    let term = ctx.status.borrow().current_term;
    let mut snapshot = {
        let take = ctx.sm.borrow_mut().take_snapshot();
        match take {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    target: "skiff::raft",
                    group_id = ctx.group_id,
                    "take_snapshot failed: {e}"
                );
                set_group_error(ctx, "take_snapshot failed");
                return Ok(());
            }
        }
    };
    let last_index = snapshot.last_included_index();
    let last_term = snapshot.last_included_term();
    tracing::info!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        peer,
        last_index,
        "streaming snapshot to peer"
    );
    let mut offset = 0u64;
    loop {
        {
            let status = ctx.status.borrow();
            if !status.is_leader() || status.current_term != term {
                return Ok(());
            }
        }
        let chunk = match snapshot.read_next() {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(
                    target: "skiff::raft",
                    group_id = ctx.group_id,
                    peer,
                    "snapshot read failed, aborting install: {e}"
                );
                return Ok(());
            }
        };
        let done = chunk.is_none();
        let data = chunk.unwrap_or_default();
        let req = InstallSnapshotReq {
            group_id: ctx.group_id,
            term,
            leader_id: ctx.node_id,
            last_included_index: last_index,
            last_included_term: last_term,
            offset,
            done,
            data: data.clone(),
        };
        let send_time = Instant::now();
        let resp = with_deadline(
            ctx.transport.send(peer, RpcRequest::InstallSnapshot(req)),
            send_time + ctx.rpc_timeout,
        )
        .await;
        match resp {
            Ok(RpcResponse::InstallSnapshot(resp)) if resp.success => {
                with_member(ctx, peer, |m| m.last_confirm = Some(send_time));
                update_lease(ctx);
                if done {
                    with_member(ctx, peer, |m| {
                        m.installing_snapshot = false;
                        m.next_index = last_index + 1;
                        if last_index > m.match_index {
                            m.match_index = last_index;
                        }
                    });
                    crate::commit::try_advance(ctx).await?;
                    tracing::info!(
                        target: "skiff::raft",
                        group_id = ctx.group_id,
                        peer,
                        last_index,
                        "snapshot install complete"
                    );
                    return Ok(());
                }
                offset += data.len() as u64;
            }
            Ok(RpcResponse::InstallSnapshot(resp)) => {
                if resp.term > term {
                    convert_to_follower(ctx, Some(resp.term), None, true).await?;
                } else {
                    tracing::warn!(
                        target: "skiff::raft",
                        group_id = ctx.group_id,
                        peer,
                        "peer rejected snapshot chunk"
                    );
                }
                return Ok(());
            }
            Ok(_) => {
                skf_core::bug("install rpc answered with wrong response type");
                return Ok(());
            }
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => {
                // Restart the whole install on the next replication round.
                tracing::warn!(
                    target: "skiff::raft",
                    group_id = ctx.group_id,
                    peer,
                    "snapshot chunk rpc failed: {e}"
                );
                skf_fiber::sleep(ctx.heartbeat_interval).await?;
                return Ok(());
            }
        }
    }
}
