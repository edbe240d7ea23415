//! Multi-group host: builds groups over one dispatcher and one I/O
//! pool, gates writes behind the global admission counters, and exposes
//! the cross-thread read/write entry points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use bytes::Bytes;
use skf_core::{GroupConfig, GroupId, NodeId, PendingGate, RaftError, Result, ServerConfig};
use skf_fiber::{ChannelSender, Dispatcher, FutureCompleter, IoExecutor};

use crate::codec::{RpcRequest, RpcResponse};
use crate::group::{GroupWork, RaftGroup};
use crate::sm::{RaftInput, Snapshot, StateMachine};
use crate::status::{RaftRole, ShareStatus};
use crate::tail::RaftTask;
use crate::transport::{IncomingRequest, RaftTransport, RequestHandler};

/// Blocking I/O worker threads shared by every group.
const IO_THREADS: usize = 4;

/// One group's construction inputs.
pub struct GroupInput {
    pub config: GroupConfig,
    pub state_machine: Box<dyn StateMachine>,
    /// Latest locally stored snapshot, fed to the state machine before
    /// the log replays.
    pub boot_snapshot: Option<Box<dyn Snapshot>>,
}

/// Client-side handle for one submitted proposal.
pub struct PendingWrite {
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl PendingWrite {
    /// Block until the proposal applies or fails.
    pub fn wait(&self, timeout: Duration) -> Result<Bytes> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(RaftError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RaftError::Stopped),
        }
    }
}

struct ServerHandler {
    routes: HashMap<GroupId, ChannelSender<IncomingRequest>>,
}

impl RequestHandler for ServerHandler {
    fn handle(&self, from: NodeId, request: RpcRequest, reply: FutureCompleter<RpcResponse>) {
        let group_id = request.group_id();
        match self.routes.get(&group_id) {
            Some(route) => route.send(IncomingRequest {
                from,
                request,
                reply,
            }),
            None => reply.complete(Err(RaftError::GroupNotFound { group_id })),
        }
    }
}

pub struct RaftServer {
    config: Arc<ServerConfig>,
    dispatcher: Dispatcher,
    io: Arc<IoExecutor>,
    gate: Arc<PendingGate>,
    groups: HashMap<GroupId, RaftGroup>,
    handler: Arc<ServerHandler>,
    stopped: AtomicBool,
}

impl RaftServer {
    pub fn new(
        config: ServerConfig,
        group_inputs: Vec<GroupInput>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        config.validate()?;
        for input in &group_inputs {
            input.config.validate(&config)?;
        }
        let config = Arc::new(config);
        let dispatcher = Dispatcher::new(&format!("node-{}", config.node_id));
        let io = Arc::new(IoExecutor::new(
            &format!("node-{}", config.node_id),
            IO_THREADS,
        ));
        let gate = PendingGate::new(config.max_pending_writes, config.max_pending_write_bytes);

        let mut groups: HashMap<GroupId, RaftGroup> = HashMap::new();
        let mut routes = HashMap::new();
        let abort = |groups: &HashMap<GroupId, RaftGroup>, extra: Option<&skf_fiber::GroupHandle>| {
            for group in groups.values() {
                group.handle.request_shutdown();
            }
            if let Some(handle) = extra {
                handle.request_shutdown();
            }
        };
        for input in group_inputs {
            let group_id = input.config.group_id;
            if groups.contains_key(&group_id) {
                abort(&groups, None);
                return Err(RaftError::Config(format!("duplicate group id {group_id}")));
            }
            let handle = dispatcher.create_group(&format!(
                "raft-{}-{}",
                config.node_id, group_id
            ));
            let group = match RaftGroup::spawn(
                &config,
                input.config,
                input.state_machine,
                input.boot_snapshot,
                Arc::clone(&transport),
                handle.clone(),
                Arc::clone(&io),
            ) {
                Ok(group) => group,
                Err(e) => {
                    abort(&groups, Some(&handle));
                    return Err(e);
                }
            };
            routes.insert(group_id, group.rpc_tx.clone());
            groups.insert(group_id, group);
        }

        Ok(Self {
            config,
            dispatcher,
            io,
            gate,
            groups,
            handler: Arc::new(ServerHandler { routes }),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Inbound side of the transport.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::clone(&self.handler) as Arc<dyn RequestHandler>
    }

    /// Block until every group is ready: bootstrapped, an elect quorum
    /// of members answering pings, apply caught up to the snapshot.
    pub fn start(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for group in self.groups.values() {
            group.ready_gate.wait_until(deadline).map_err(|e| {
                tracing::error!(
                    target: "skiff::raft",
                    group_id = group.group_id(),
                    "group failed to become ready: {e}"
                );
                e
            })?;
        }
        tracing::info!(
            target: "skiff::raft",
            node_id = self.config.node_id,
            groups = self.groups.len(),
            "server started"
        );
        Ok(())
    }

    /// Shut every group down, drain the dispatcher and the I/O pool.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for group in self.groups.values() {
            group.handle.request_shutdown();
        }
        for group in self.groups.values() {
            group.handle.join();
        }
        self.dispatcher.stop();
        self.io.shutdown();
        tracing::info!(
            target: "skiff::raft",
            node_id = self.config.node_id,
            "server stopped"
        );
    }

    fn group(&self, group_id: GroupId) -> Result<&RaftGroup> {
        self.groups
            .get(&group_id)
            .ok_or(RaftError::GroupNotFound { group_id })
    }

    /// Submit one proposal. Admission control rejects when the process
    /// is over its pending-writes or pending-bytes budget; the returned
    /// handle resolves when the entry applies.
    pub fn submit_linear_task(&self, group_id: GroupId, input: RaftInput) -> Result<PendingWrite> {
        let group = self.group(group_id)?;
        if group.shared.is_error() {
            return Err(RaftError::GroupFailed { group_id });
        }
        let size = input.size();
        if size > self.config.max_body_size {
            return Err(RaftError::BodyTooLarge {
                size,
                max: self.config.max_body_size,
            });
        }
        let ticket = self.gate.acquire(size as u64)?;
        let (tx, rx) = mpsc::channel();
        group.work_tx.send(GroupWork::Propose(RaftTask {
            item_type: skf_store::LogItem::TYPE_NORMAL,
            input,
            term: 0,
            reply: Some(tx),
            ticket: Some(ticket),
        }));
        Ok(PendingWrite { rx })
    }

    /// Linearizable read fence: verify leadership and lease, wait for
    /// the first commit of the current leadership to apply, then return
    /// the applied index the caller may read the state machine at.
    pub fn get_log_index_for_read(&self, group_id: GroupId, deadline: Instant) -> Result<u64> {
        let group = self.group(group_id)?;
        if group.shared.is_error() {
            return Err(RaftError::GroupFailed { group_id });
        }
        let share = group.shared.share.load_full();
        if share.role != RaftRole::Leader {
            return Err(RaftError::NotLeader {
                leader: share.current_leader,
            });
        }
        match share.lease_end {
            Some(end) if Instant::now() < end => {}
            _ => return Err(RaftError::NotLeader { leader: None }),
        }
        if let Some(gate) = &share.first_commit_gate {
            gate.wait_until(deadline)?;
            let share = group.shared.share.load_full();
            if share.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader: share.current_leader,
                });
            }
            return Ok(share.last_applied);
        }
        Ok(share.last_applied)
    }

    /// Reclamation hook for the snapshot producer: once state up to
    /// `max_index` is snapshotted, segments wholly below it may be
    /// deleted after `delay_millis`. Capped at `commit_index - 1`.
    pub fn mark_truncate_by_index(
        &self,
        group_id: GroupId,
        max_index: u64,
        delay_millis: u64,
    ) -> Result<()> {
        let group = self.group(group_id)?;
        group.work_tx.send(GroupWork::MarkTruncateByIndex {
            max_index,
            delay_millis,
        });
        Ok(())
    }

    /// Reclamation by record age: committed segments whose newest record
    /// is at or before `timestamp_millis` become deletable.
    pub fn mark_truncate_by_timestamp(
        &self,
        group_id: GroupId,
        timestamp_millis: u64,
        delay_millis: u64,
    ) -> Result<()> {
        let group = self.group(group_id)?;
        group.work_tx.send(GroupWork::MarkTruncateByTimestamp {
            timestamp_millis,
            delay_millis,
        });
        Ok(())
    }

    /// Lock-free status snapshot of one group.
    pub fn group_status(&self, group_id: GroupId) -> Result<Arc<ShareStatus>> {
        Ok(self.group(group_id)?.shared.share.load_full())
    }

    #[must_use]
    pub fn pending_writes(&self) -> u64 {
        self.gate.pending_writes()
    }

    #[must_use]
    pub fn pending_write_bytes(&self) -> u64 {
        self.gate.pending_write_bytes()
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.stop();
    }
}
