#![allow(clippy::unwrap_used)]

//! Multi-node scenarios over an in-process loopback transport. Requests
//! are encoded and decoded on the way through, so the wire codec is
//! exercised end to end.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use skf_core::{GroupConfig, NodeId, RaftError, ServerConfig};
use skf_fiber::FiberFuture;
use skf_raft::codec::{RpcRequest, RpcResponse};
use skf_raft::{
    GroupInput, RaftInput, RaftRole, RaftServer, RaftTransport, RequestHandler, Snapshot,
    StateMachine,
};

const GROUP: u32 = 1;

/// `RUST_LOG=skiff=debug cargo test -- --nocapture` to watch a scenario.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------
// Loopback transport
// ---------------------------------------------------------------------

#[derive(Default)]
struct Hub {
    handlers: Mutex<HashMap<NodeId, Arc<dyn RequestHandler>>>,
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
}

impl Hub {
    fn register(&self, node: NodeId, handler: Arc<dyn RequestHandler>) {
        self.handlers.lock().unwrap().insert(node, handler);
    }

    fn partition(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.lock().unwrap();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    fn heal(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.lock().unwrap();
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    fn isolate(&self, node: NodeId, others: &[NodeId]) {
        for other in others {
            if *other != node {
                self.partition(node, *other);
            }
        }
    }

    fn heal_all(&self, node: NodeId, others: &[NodeId]) {
        for other in others {
            if *other != node {
                self.heal(node, *other);
            }
        }
    }
}

struct Loopback {
    from: NodeId,
    hub: Arc<Hub>,
}

impl RaftTransport for Loopback {
    fn send(&self, to: NodeId, request: RpcRequest) -> FiberFuture<RpcResponse> {
        let (future, completer) = FiberFuture::new();
        if self.hub.blocked.lock().unwrap().contains(&(self.from, to)) {
            completer.complete(Err(RaftError::Io(std::io::Error::other("link blocked"))));
            return future;
        }
        let handler = self.hub.handlers.lock().unwrap().get(&to).cloned();
        let Some(handler) = handler else {
            completer.complete(Err(RaftError::Io(std::io::Error::other("peer unknown"))));
            return future;
        };
        // Round-trip through the wire format.
        let decoded = match RpcRequest::decode(request.command(), &request.encode()) {
            Ok(decoded) => decoded,
            Err(e) => {
                completer.complete(Err(e));
                return future;
            }
        };
        handler.handle(self.from, decoded, completer);
        future
    }
}

// ---------------------------------------------------------------------
// Test state machine: a string KV driven by "set k=v" bodies.
// ---------------------------------------------------------------------

type SharedMap = Arc<Mutex<HashMap<String, String>>>;
type ExecGate = Arc<(Mutex<bool>, Condvar)>;

struct KvSm {
    map: SharedMap,
    gate: Option<ExecGate>,
    last_applied: u64,
    last_term: u32,
    install_buf: Vec<u8>,
}

impl KvSm {
    fn new(map: SharedMap, gate: Option<ExecGate>) -> Self {
        Self {
            map,
            gate,
            last_applied: 0,
            last_term: 0,
            install_buf: Vec::new(),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let map = self.map.lock().unwrap();
        let mut entries: Vec<String> = map.iter().map(|(k, v)| format!("{k}={v}")).collect();
        entries.sort();
        entries.join("\n").into_bytes()
    }
}

impl StateMachine for KvSm {
    fn exec(
        &mut self,
        index: u64,
        term: u32,
        input: &RaftInput,
    ) -> skf_core::Result<Bytes> {
        if let Some(gate) = &self.gate {
            let (flag, cv) = &**gate;
            let mut released = flag.lock().unwrap();
            while !*released {
                released = cv.wait(released).unwrap();
            }
        }
        let body = std::str::from_utf8(&input.body)
            .map_err(|_| RaftError::StateMachine("non-utf8 body".into()))?;
        let assignment = body
            .strip_prefix("set ")
            .ok_or_else(|| RaftError::StateMachine(format!("bad command: {body}")))?;
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| RaftError::StateMachine(format!("bad assignment: {assignment}")))?;
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.last_applied = index;
        self.last_term = term;
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn install_snapshot(
        &mut self,
        last_included_index: u64,
        last_included_term: u32,
        offset: u64,
        done: bool,
        data: &[u8],
    ) -> skf_core::Result<()> {
        if offset == 0 {
            self.install_buf.clear();
        }
        self.install_buf.extend_from_slice(data);
        if done {
            let mut map = self.map.lock().unwrap();
            map.clear();
            let text = std::str::from_utf8(&self.install_buf)
                .map_err(|_| RaftError::StateMachine("bad snapshot bytes".into()))?;
            for line in text.lines() {
                if let Some((k, v)) = line.split_once('=') {
                    map.insert(k.to_string(), v.to_string());
                }
            }
            self.last_applied = last_included_index;
            self.last_term = last_included_term;
        }
        Ok(())
    }

    fn take_snapshot(&mut self) -> skf_core::Result<Box<dyn Snapshot>> {
        Ok(Box::new(KvSnapshot {
            data: self.serialize(),
            pos: 0,
            last_included_index: self.last_applied,
            last_included_term: self.last_term,
        }))
    }

    fn close(&mut self) -> skf_core::Result<()> {
        Ok(())
    }
}

struct KvSnapshot {
    data: Vec<u8>,
    pos: usize,
    last_included_index: u64,
    last_included_term: u32,
}

impl Snapshot for KvSnapshot {
    fn last_included_index(&self) -> u64 {
        self.last_included_index
    }

    fn last_included_term(&self) -> u32 {
        self.last_included_term
    }

    fn read_next(&mut self) -> skf_core::Result<Option<Bytes>> {
        // Small chunks so the install protocol sees several offsets.
        const CHUNK: usize = 32;
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + CHUNK).min(self.data.len());
        let chunk = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(Some(chunk))
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct NodeOpts {
    log_file_size: u64,
    max_pending_writes: u64,
    gate: Option<ExecGate>,
    observer_ids: String,
}

impl Default for NodeOpts {
    fn default() -> Self {
        Self {
            log_file_size: 64 * 1024,
            max_pending_writes: 10_000,
            gate: None,
            observer_ids: String::new(),
        }
    }
}

struct TestNode {
    server: RaftServer,
    map: SharedMap,
}

fn servers_list(node_ids: &[NodeId]) -> String {
    node_ids
        .iter()
        .map(|id| format!("{id}@127.0.0.1:{}", 5000 + id))
        .collect::<Vec<_>>()
        .join(",")
}

fn make_node(
    hub: &Arc<Hub>,
    node_id: NodeId,
    all_ids: &[NodeId],
    voting: &str,
    data_dir: &std::path::Path,
    opts: NodeOpts,
) -> TestNode {
    let config = ServerConfig {
        node_id,
        raft_port: 5000 + node_id as u16,
        servers: servers_list(all_ids),
        elect_timeout_ms: 300,
        heartbeat_interval_ms: 60,
        rpc_timeout_ms: 300,
        max_pending_writes: opts.max_pending_writes,
        max_pending_write_bytes: 64 * 1024 * 1024,
        max_body_size: 1024 * 1024,
        io_retry_interval_ms: vec![10, 20, 50],
    };
    let group_config = GroupConfig {
        group_id: GROUP,
        ids: voting.to_string(),
        data_dir: data_dir.join(format!("node-{node_id}")),
        observer_ids: opts.observer_ids,
        observer: false,
        log_file_size: opts.log_file_size,
        idx_file_size: 8 * 1024,
    };
    let map: SharedMap = Arc::new(Mutex::new(HashMap::new()));
    let sm = Box::new(KvSm::new(Arc::clone(&map), opts.gate));
    let transport = Arc::new(Loopback {
        from: node_id,
        hub: Arc::clone(hub),
    });
    let server = RaftServer::new(
        config,
        vec![GroupInput {
            config: group_config,
            state_machine: sm,
            boot_snapshot: None,
        }],
        transport,
    )
    .unwrap();
    hub.register(node_id, server.handler());
    TestNode { server, map }
}

fn set_cmd(key: &str, value: &str) -> RaftInput {
    RaftInput::new(0, Bytes::new(), Bytes::from(format!("set {key}={value}")))
}

fn wait_leader(nodes: &[(&TestNode, NodeId)], timeout: Duration) -> NodeId {
    let deadline = Instant::now() + timeout;
    loop {
        for (node, id) in nodes {
            let status = node.server.group_status(GROUP).unwrap();
            if status.role == RaftRole::Leader {
                return *id;
            }
        }
        assert!(Instant::now() < deadline, "no leader elected in time");
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn wait_value(map: &SharedMap, key: &str, expect: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if map.lock().unwrap().get(key).map(String::as_str) == Some(expect) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "key {key} never reached {expect}"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[test]
fn test_single_node_leader_write_and_restart() {
    init_logging();
    let hub = Arc::new(Hub::default());
    let dir = tempfile::tempdir().unwrap();
    {
        let node = make_node(&hub, 1, &[1], "1", dir.path(), NodeOpts::default());
        node.server.start(Duration::from_secs(10)).unwrap();

        // Single-node groups lead immediately.
        let status = node.server.group_status(GROUP).unwrap();
        assert_eq!(status.role, RaftRole::Leader);

        let pending = node.server.submit_linear_task(GROUP, set_cmd("a", "1")).unwrap();
        assert_eq!(pending.wait(Duration::from_secs(10)).unwrap().as_ref(), b"1");

        let index = node
            .server
            .get_log_index_for_read(GROUP, Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert!(index >= 1);
        assert_eq!(node.map.lock().unwrap().get("a").unwrap(), "1");
        node.server.stop();
    }

    // Restart on the same directory: the log replays into a fresh state
    // machine.
    let node = make_node(&hub, 1, &[1], "1", dir.path(), NodeOpts::default());
    node.server.start(Duration::from_secs(10)).unwrap();
    node.server
        .get_log_index_for_read(GROUP, Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(node.map.lock().unwrap().get("a").unwrap(), "1");
    node.server.stop();
}

#[test]
fn test_three_node_replication_and_failover() {
    init_logging();
    let hub = Arc::new(Hub::default());
    let dir = tempfile::tempdir().unwrap();
    let ids = [1u32, 2, 3];
    let n1 = make_node(&hub, 1, &ids, "1,2,3", dir.path(), NodeOpts::default());
    let n2 = make_node(&hub, 2, &ids, "1,2,3", dir.path(), NodeOpts::default());
    let n3 = make_node(&hub, 3, &ids, "1,2,3", dir.path(), NodeOpts::default());
    for node in [&n1, &n2, &n3] {
        node.server.start(Duration::from_secs(20)).unwrap();
    }
    let nodes = [(&n1, 1u32), (&n2, 2), (&n3, 3)];
    let leader_id = wait_leader(&nodes, Duration::from_secs(20));
    let leader = nodes.iter().find(|(_, id)| *id == leader_id).unwrap().0;
    let old_term = leader.server.group_status(GROUP).unwrap().term;

    let pending = leader
        .server
        .submit_linear_task(GROUP, set_cmd("city", "porto"))
        .unwrap();
    pending.wait(Duration::from_secs(10)).unwrap();
    for (node, _) in &nodes {
        wait_value(&node.map, "city", "porto", Duration::from_secs(10));
    }

    // Submitting to a follower names the leader.
    let follower = nodes.iter().find(|(_, id)| *id != leader_id).unwrap().0;
    let rejected = follower
        .server
        .submit_linear_task(GROUP, set_cmd("x", "y"))
        .unwrap();
    match rejected.wait(Duration::from_secs(10)) {
        Err(RaftError::NotLeader { leader }) => assert_eq!(leader, Some(leader_id)),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    // Kill the leader; a survivor takes over in a strictly higher term.
    leader.server.stop();
    let survivors: Vec<(&TestNode, NodeId)> = nodes
        .iter()
        .filter(|(_, id)| *id != leader_id)
        .map(|(n, id)| (*n, *id))
        .collect();
    let new_leader_id = wait_leader(&survivors, Duration::from_secs(30));
    let new_leader = survivors
        .iter()
        .find(|(_, id)| *id == new_leader_id)
        .unwrap()
        .0;
    let new_term = new_leader.server.group_status(GROUP).unwrap().term;
    assert!(new_term > old_term, "{new_term} vs {old_term}");

    let pending = new_leader
        .server
        .submit_linear_task(GROUP, set_cmd("city", "lisbon"))
        .unwrap();
    pending.wait(Duration::from_secs(20)).unwrap();
    for (node, _) in &survivors {
        wait_value(&node.map, "city", "lisbon", Duration::from_secs(10));
    }
    for (node, _) in &survivors {
        node.server.stop();
    }
}

#[test]
fn test_partitioned_leader_tail_is_overwritten() {
    init_logging();
    let hub = Arc::new(Hub::default());
    let dir = tempfile::tempdir().unwrap();
    let ids = [1u32, 2, 3];
    let n1 = make_node(&hub, 1, &ids, "1,2,3", dir.path(), NodeOpts::default());
    let n2 = make_node(&hub, 2, &ids, "1,2,3", dir.path(), NodeOpts::default());
    let n3 = make_node(&hub, 3, &ids, "1,2,3", dir.path(), NodeOpts::default());
    for node in [&n1, &n2, &n3] {
        node.server.start(Duration::from_secs(20)).unwrap();
    }
    let nodes = [(&n1, 1u32), (&n2, 2), (&n3, 3)];
    let old_leader_id = wait_leader(&nodes, Duration::from_secs(20));
    let old_leader = nodes.iter().find(|(_, id)| *id == old_leader_id).unwrap().0;

    // Cut the leader off and propose to it; the entry persists locally
    // but can never commit.
    hub.isolate(old_leader_id, &ids);
    let orphan = old_leader
        .server
        .submit_linear_task(GROUP, set_cmd("orphan", "1"))
        .unwrap();

    // The majority side elects a new leader and commits a write.
    let majority: Vec<(&TestNode, NodeId)> = nodes
        .iter()
        .filter(|(_, id)| *id != old_leader_id)
        .map(|(n, id)| (*n, *id))
        .collect();
    let new_leader_id = wait_leader(&majority, Duration::from_secs(30));
    let new_leader = majority
        .iter()
        .find(|(_, id)| *id == new_leader_id)
        .unwrap()
        .0;
    new_leader
        .server
        .submit_linear_task(GROUP, set_cmd("winner", "yes"))
        .unwrap()
        .wait(Duration::from_secs(20))
        .unwrap();

    // Heal. The deposed leader truncates its divergent tail and adopts
    // the new leader's log.
    hub.heal_all(old_leader_id, &ids);
    for (node, _) in &nodes {
        wait_value(&node.map, "winner", "yes", Duration::from_secs(30));
    }
    assert!(
        !old_leader.map.lock().unwrap().contains_key("orphan"),
        "uncommitted divergent entry must not apply"
    );
    match orphan.wait(Duration::from_secs(20)) {
        Err(_) => {}
        Ok(v) => panic!("orphan write must fail, got {v:?}"),
    }
    for (node, _) in &nodes {
        node.server.stop();
    }
}

#[test]
fn test_snapshot_install_for_lagging_follower() {
    init_logging();
    let hub = Arc::new(Hub::default());
    let dir = tempfile::tempdir().unwrap();
    let ids = [1u32, 2, 3];
    let opts = || NodeOpts {
        log_file_size: 4096,
        ..NodeOpts::default()
    };
    let n1 = make_node(&hub, 1, &ids, "1,2,3", dir.path(), opts());
    let n2 = make_node(&hub, 2, &ids, "1,2,3", dir.path(), opts());
    let n3 = make_node(&hub, 3, &ids, "1,2,3", dir.path(), opts());
    for node in [&n1, &n2, &n3] {
        node.server.start(Duration::from_secs(20)).unwrap();
    }
    let nodes = [(&n1, 1u32), (&n2, 2), (&n3, 3)];
    let leader_id = wait_leader(&nodes, Duration::from_secs(20));
    let leader = nodes.iter().find(|(_, id)| *id == leader_id).unwrap().0;

    // Pick a follower to lag behind.
    let lagging_id = *ids.iter().find(|id| **id != leader_id).unwrap();
    let lagging = nodes.iter().find(|(_, id)| *id == lagging_id).unwrap().0;
    hub.isolate(lagging_id, &ids);

    // Fill several segments while the follower is cut off.
    for i in 0..150u32 {
        leader
            .server
            .submit_linear_task(GROUP, set_cmd(&format!("k{i}"), &format!("v{i}")))
            .unwrap()
            .wait(Duration::from_secs(10))
            .unwrap();
    }
    let applied = leader
        .server
        .get_log_index_for_read(GROUP, Instant::now() + Duration::from_secs(5))
        .unwrap();

    // Reclaim the leader's prefix so plain log repair is impossible.
    leader
        .server
        .mark_truncate_by_index(GROUP, applied.saturating_sub(5), 0)
        .unwrap();
    std::thread::sleep(Duration::from_millis(500));

    // Reconnect: the leader must fall back to snapshot install, then
    // resume log replication past the boundary.
    hub.heal_all(lagging_id, &ids);
    wait_value(&lagging.map, "k149", "v149", Duration::from_secs(30));

    leader
        .server
        .submit_linear_task(GROUP, set_cmd("post", "install"))
        .unwrap()
        .wait(Duration::from_secs(10))
        .unwrap();
    wait_value(&lagging.map, "post", "install", Duration::from_secs(10));
    for (node, _) in &nodes {
        node.server.stop();
    }
}

#[test]
fn test_backpressure_rejects_beyond_limit() {
    init_logging();
    let hub = Arc::new(Hub::default());
    let dir = tempfile::tempdir().unwrap();
    let gate: ExecGate = Arc::new((Mutex::new(false), Condvar::new()));
    let node = make_node(
        &hub,
        1,
        &[1],
        "1",
        dir.path(),
        NodeOpts {
            max_pending_writes: 100,
            gate: Some(Arc::clone(&gate)),
            ..NodeOpts::default()
        },
    );
    node.server.start(Duration::from_secs(10)).unwrap();

    // The state machine is gated shut, so completions cannot release
    // tickets while we submit.
    let mut accepted = Vec::new();
    let mut rejected = 0usize;
    for i in 0..200u32 {
        match node
            .server
            .submit_linear_task(GROUP, set_cmd(&format!("p{i}"), "x"))
        {
            Ok(pending) => accepted.push(pending),
            Err(RaftError::Backpressure { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted.len(), 100);
    assert_eq!(rejected, 100);

    // Open the gate; everything accepted must complete and the counters
    // must return to zero.
    {
        let (flag, cv) = &*gate;
        *flag.lock().unwrap() = true;
        cv.notify_all();
    }
    for pending in accepted {
        pending.wait(Duration::from_secs(30)).unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while node.server.pending_writes() != 0 {
        assert!(Instant::now() < deadline, "pending counter stuck");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(node.server.pending_write_bytes(), 0);
    node.server.stop();
}

#[test]
fn test_restart_with_stale_commit_hint_replays_log() {
    init_logging();
    let hub = Arc::new(Hub::default());
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("node-1").join("status");

    // First run: a few writes, stop, keep the early status record.
    {
        let node = make_node(&hub, 1, &[1], "1", dir.path(), NodeOpts::default());
        node.server.start(Duration::from_secs(10)).unwrap();
        for i in 0..5u32 {
            node.server
                .submit_linear_task(GROUP, set_cmd(&format!("k{i}"), &format!("v{i}")))
                .unwrap()
                .wait(Duration::from_secs(10))
                .unwrap();
        }
        node.server.stop();
    }
    let early_status = std::fs::read(&status_path).unwrap();

    // Second run: more writes, stop, then roll the status file back to
    // simulate a crash that lost the commit hint.
    {
        let node = make_node(&hub, 1, &[1], "1", dir.path(), NodeOpts::default());
        node.server.start(Duration::from_secs(10)).unwrap();
        for i in 5..20u32 {
            node.server
                .submit_linear_task(GROUP, set_cmd(&format!("k{i}"), &format!("v{i}")))
                .unwrap()
                .wait(Duration::from_secs(10))
                .unwrap();
        }
        node.server.stop();
    }
    std::fs::write(&status_path, &early_status).unwrap();

    // Third run: restore must scan past the stale hint and replay every
    // entry.
    let node = make_node(&hub, 1, &[1], "1", dir.path(), NodeOpts::default());
    node.server.start(Duration::from_secs(10)).unwrap();
    node.server
        .get_log_index_for_read(GROUP, Instant::now() + Duration::from_secs(5))
        .unwrap();
    let map = node.map.lock().unwrap();
    for i in 0..20u32 {
        assert_eq!(
            map.get(&format!("k{i}")).map(String::as_str),
            Some(format!("v{i}").as_str()),
            "k{i} missing after replay"
        );
    }
    drop(map);
    node.server.stop();
}

#[test]
fn test_observer_replicates_but_never_leads() {
    init_logging();
    let hub = Arc::new(Hub::default());
    let dir = tempfile::tempdir().unwrap();
    let ids = [1u32, 2, 3, 4];
    let opts = || NodeOpts {
        observer_ids: "4".to_string(),
        ..NodeOpts::default()
    };
    let n1 = make_node(&hub, 1, &ids, "1,2,3", dir.path(), opts());
    let n2 = make_node(&hub, 2, &ids, "1,2,3", dir.path(), opts());
    let n3 = make_node(&hub, 3, &ids, "1,2,3", dir.path(), opts());
    let n4 = make_node(&hub, 4, &ids, "1,2,3", dir.path(), opts());
    for node in [&n1, &n2, &n3, &n4] {
        node.server.start(Duration::from_secs(20)).unwrap();
    }
    let voters = [(&n1, 1u32), (&n2, 2), (&n3, 3)];
    let leader_id = wait_leader(&voters, Duration::from_secs(20));
    let leader = voters.iter().find(|(_, id)| *id == leader_id).unwrap().0;

    leader
        .server
        .submit_linear_task(GROUP, set_cmd("seen", "by-observer"))
        .unwrap()
        .wait(Duration::from_secs(10))
        .unwrap();
    wait_value(&n4.map, "seen", "by-observer", Duration::from_secs(15));

    // The observer never campaigns.
    assert_eq!(
        n4.server.group_status(GROUP).unwrap().role,
        RaftRole::Observer
    );
    for node in [&n1, &n2, &n3, &n4] {
        node.server.stop();
    }
}
