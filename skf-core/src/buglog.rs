//! Bug-record logging.
//!
//! Expected shutdown signals (interrupt/cancel/stop) are logged by their
//! owners at info level; anything routed through here is an invariant
//! breach and is kept on a dedicated target so operators can alert on it.

use crate::RaftError;

pub fn bug(context: &'static str) {
    tracing::error!(target: "skiff::bug", context, "invariant breach");
}

pub fn bug_err(context: &'static str, err: &RaftError) {
    if err.is_shutdown() {
        tracing::info!(target: "skiff::bug", context, "shutdown signal, not a bug: {err}");
    } else {
        tracing::error!(target: "skiff::bug", context, "invariant breach: {err}");
    }
}
