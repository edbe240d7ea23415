use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{NodeId, RaftError, Result};

/// One `id@host:port` entry from the `servers` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}

/// Process-wide configuration shared by every consensus group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub node_id: NodeId,
    pub raft_port: u16,
    /// Comma-separated `id@host:port` list covering every node of the
    /// deployment. Group member sets must be subsets of this list.
    pub servers: String,
    #[serde(default = "default_elect_timeout_ms")]
    pub elect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_max_pending_writes")]
    pub max_pending_writes: u64,
    #[serde(default = "default_max_pending_write_bytes")]
    pub max_pending_write_bytes: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Backoff schedule for retryable I/O, in milliseconds. Must be
    /// non-decreasing; exhaustion surfaces the underlying error.
    #[serde(default = "default_io_retry_interval_ms")]
    pub io_retry_interval_ms: Vec<u64>,
}

fn default_elect_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_max_pending_writes() -> u64 {
    10_000
}

fn default_max_pending_write_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_body_size() -> usize {
    8 * 1024 * 1024
}

fn default_io_retry_interval_ms() -> Vec<u64> {
    vec![100, 1000, 3000, 5000, 10_000, 20_000]
}

impl ServerConfig {
    /// Load from a TOML or JSON file, dispatching on the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| RaftError::Config(format!("invalid TOML: {e}")))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| RaftError::Config(format!("invalid JSON: {e}")))?,
            other => {
                return Err(RaftError::Config(format!(
                    "unsupported config extension: {other:?}"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(RaftError::Config("node_id must be positive".into()));
        }
        if self.raft_port == 0 {
            return Err(RaftError::Config("raft_port must be positive".into()));
        }
        let servers = parse_servers(&self.servers)?;
        if !servers.iter().any(|s| s.node_id == self.node_id) {
            return Err(RaftError::Config(format!(
                "node_id {} not present in servers list",
                self.node_id
            )));
        }
        if self.heartbeat_interval_ms >= self.elect_timeout_ms {
            return Err(RaftError::Config(
                "heartbeat_interval must be smaller than elect_timeout".into(),
            ));
        }
        if self
            .io_retry_interval_ms
            .windows(2)
            .any(|w| w[0] > w[1])
        {
            return Err(RaftError::Config(
                "io_retry_interval must be non-decreasing".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn elect_timeout(&self) -> Duration {
        Duration::from_millis(self.elect_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[inline]
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub fn io_retry_interval(&self) -> Vec<Duration> {
        self.io_retry_interval_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

/// Per-group configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: crate::GroupId,
    /// Comma-separated member node ids, e.g. `"1,2,3"`. Static for the
    /// life of the group.
    pub ids: String,
    pub data_dir: PathBuf,
    /// Comma-separated observer node ids, e.g. `"4,5"`. Observers
    /// replicate but never vote, never count in quorums and never
    /// campaign.
    #[serde(default)]
    pub observer_ids: String,
    /// Force this node to join as an observer.
    #[serde(default)]
    pub observer: bool,
    /// Log segment size in bytes. Must be a power of two.
    #[serde(default = "default_log_file_size")]
    pub log_file_size: u64,
    /// Index segment size in bytes. Must be a power of two.
    #[serde(default = "default_idx_file_size")]
    pub idx_file_size: u64,
}

fn default_log_file_size() -> u64 {
    64 * 1024 * 1024
}

fn default_idx_file_size() -> u64 {
    8 * 1024 * 1024
}

impl GroupConfig {
    pub fn validate(&self, server: &ServerConfig) -> Result<()> {
        let members = parse_member_ids(&self.ids)?;
        if members.is_empty() {
            return Err(RaftError::Config(format!(
                "group {} has no members",
                self.group_id
            )));
        }
        let servers = parse_servers(&server.servers)?;
        let observers = parse_member_ids(&self.observer_ids)?;
        for id in members.iter().chain(&observers) {
            if !servers.iter().any(|s| s.node_id == *id) {
                return Err(RaftError::Config(format!(
                    "group {} member {id} not in servers list",
                    self.group_id
                )));
            }
        }
        for id in &observers {
            if members.contains(id) {
                return Err(RaftError::Config(format!(
                    "group {} node {id} is both voting member and observer",
                    self.group_id
                )));
            }
        }
        for (name, size) in [
            ("log_file_size", self.log_file_size),
            ("idx_file_size", self.idx_file_size),
        ] {
            if size == 0 || !size.is_power_of_two() {
                return Err(RaftError::Config(format!(
                    "group {}: {name} must be a power of two, got {size}",
                    self.group_id
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn member_ids(&self) -> Vec<NodeId> {
        parse_member_ids(&self.ids).unwrap_or_default()
    }
}

/// Parse a `"1@host:5001,2@host:5002"` servers list.
pub fn parse_servers(s: &str) -> Result<Vec<NodeAddr>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (id_str, addr) = part
            .split_once('@')
            .ok_or_else(|| RaftError::Config(format!("bad server entry: {part}")))?;
        let (host, port_str) = addr
            .rsplit_once(':')
            .ok_or_else(|| RaftError::Config(format!("bad server address: {addr}")))?;
        let node_id: NodeId = id_str
            .trim()
            .parse()
            .map_err(|_| RaftError::Config(format!("bad node id: {id_str}")))?;
        let port: u16 = port_str
            .trim()
            .parse()
            .map_err(|_| RaftError::Config(format!("bad port: {port_str}")))?;
        if node_id == 0 {
            return Err(RaftError::Config("node id must be positive".into()));
        }
        if out.iter().any(|n: &NodeAddr| n.node_id == node_id) {
            return Err(RaftError::Config(format!("duplicate node id: {node_id}")));
        }
        if out
            .iter()
            .any(|n: &NodeAddr| n.host == host && n.port == port)
        {
            return Err(RaftError::Config(format!("duplicate address: {addr}")));
        }
        out.push(NodeAddr {
            node_id,
            host: host.trim().to_string(),
            port,
        });
    }
    if out.is_empty() {
        return Err(RaftError::Config("servers list is empty".into()));
    }
    Ok(out)
}

/// Parse a `"1,2,3"` member-id list, rejecting duplicates.
pub fn parse_member_ids(s: &str) -> Result<Vec<NodeId>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id: NodeId = part
            .parse()
            .map_err(|_| RaftError::Config(format!("bad member id: {part}")))?;
        if out.contains(&id) {
            return Err(RaftError::Config(format!("duplicate member id: {id}")));
        }
        out.push(id);
    }
    Ok(out)
}
