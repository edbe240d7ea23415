//! Commit advancement from match indexes.
//!
//! The leader commits the largest `N` such that an rwQuorum of voting
//! members has `match_index >= N` and `log[N].term == current_term`
//! (leader completeness: never commit an older term's entry by count).

use std::rc::Rc;

use skf_core::Result;

use crate::engine::term_of;
use crate::group::GroupCtx;

pub(crate) async fn try_advance(ctx: &Rc<GroupCtx>) -> Result<()> {
    let (commit, term, rw_quorum, is_leader) = {
        let status = ctx.status.borrow();
        (
            status.commit_index,
            status.current_term,
            status.rw_quorum,
            status.is_leader(),
        )
    };
    if !is_leader {
        return Ok(());
    }
    let candidate = {
        let members = ctx.members.borrow();
        let mut matches: Vec<u64> = members
            .iter()
            .filter(|m| !m.observer)
            .map(|m| m.match_index)
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        match matches.get(rw_quorum.saturating_sub(1)) {
            Some(n) => *n,
            None => return Ok(()),
        }
    };
    if candidate <= commit {
        return Ok(());
    }
    let candidate_term = match term_of(ctx, candidate).await {
        Ok(t) => t,
        Err(e) if e.is_shutdown() => return Err(e),
        Err(e) => {
            skf_core::bug_err("commit term lookup failed", &e);
            return Ok(());
        }
    };
    if candidate_term != term {
        // An earlier-term entry: wait for a current-term entry to cover it.
        return Ok(());
    }
    {
        let mut status = ctx.status.borrow_mut();
        if candidate <= status.commit_index {
            return Ok(());
        }
        status.commit_index = candidate;
    }
    ctx.log.set_commit_index(candidate);
    tracing::debug!(
        target: "skiff::raft",
        group_id = ctx.group_id,
        commit_index = candidate,
        "commit advanced"
    );
    ctx.apply_cond.signal_all();
    ctx.replicate_cond.signal_all();
    Ok(())
}
