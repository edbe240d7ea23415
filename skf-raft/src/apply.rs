//! Apply fiber: feeds committed entries to the state machine in strict
//! index order and completes the tail-cache futures.

use std::rc::Rc;

use bytes::Bytes;
use skf_core::{RaftError, Result};
use skf_store::LogItem;

use crate::group::{GroupCtx, copy_share, set_group_error};
use crate::sm::RaftInput;

const APPLY_BATCH: usize = 64;
const APPLY_BYTES: usize = 4 * 1024 * 1024;

pub(crate) async fn run_apply_loop(ctx: Rc<GroupCtx>) -> Result<()> {
    loop {
        let (applied, commit, error) = {
            let status = ctx.status.borrow();
            (status.last_applied, status.commit_index, status.error)
        };
        if error || applied >= commit {
            ctx.apply_cond.wait().await?;
            continue;
        }
        #[allow(clippy::cast_possible_truncation)]
        let limit = APPLY_BATCH.min((commit - applied) as usize);
        let items = match ctx.log.load(applied + 1, limit, APPLY_BYTES).await {
            Ok(items) => items,
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => {
                tracing::error!(
                    target: "skiff::raft",
                    group_id = ctx.group_id,
                    "loading committed entries failed: {e}"
                );
                set_group_error(&ctx, "apply load failed");
                continue;
            }
        };
        for item in items {
            if item.index > commit {
                break;
            }
            if !apply_one(&ctx, &item) {
                break;
            }
        }
        copy_share(&ctx);
    }
}

/// Returns false when the group entered the error state.
fn apply_one(ctx: &Rc<GroupCtx>, item: &LogItem) -> bool {
    let result = if item.item_type == LogItem::TYPE_NOOP {
        Ok(Bytes::new())
    } else {
        let input = RaftInput {
            biz_type: item.biz_type,
            header: item.header.clone(),
            body: item.body.clone(),
        };
        ctx.sm.borrow_mut().exec(item.index, item.term, &input)
    };
    match result {
        Ok(output) => {
            ctx.status.borrow_mut().last_applied = item.index;
            ctx.tail.borrow_mut().complete(item.index, Ok(output));
            maybe_complete_first_commit(ctx, item.index);
            true
        }
        Err(e) => {
            tracing::error!(
                target: "skiff::raft",
                group_id = ctx.group_id,
                index = item.index,
                "state machine failed: {e}"
            );
            ctx.tail
                .borrow_mut()
                .complete(item.index, Err(RaftError::StateMachine(e.to_string())));
            set_group_error(ctx, "state machine exec failed");
            false
        }
    }
}

fn maybe_complete_first_commit(ctx: &Rc<GroupCtx>, index: u64) {
    let gate = {
        let mut status = ctx.status.borrow_mut();
        if status.is_leader()
            && status.first_index_of_term != 0
            && index >= status.first_index_of_term
        {
            status.first_commit_gate.take()
        } else {
            None
        }
    };
    if let Some(gate) = gate {
        tracing::info!(
            target: "skiff::raft",
            group_id = ctx.group_id,
            index,
            "first commit of term applied, reads open"
        );
        gate.complete();
    }
}
