//! Compact wire codec for the Raft RPCs.
//!
//! Bodies are varint-tagged records: `tag = (field_number << 3) |
//! wire_type`, wire types varint (0), fixed64 (1), length-delimited (2)
//! and fixed32 (5). Zero/empty fields are omitted on encode and default
//! on decode, so fields can be added without breaking old peers.

use bytes::Bytes;
use skf_core::{GroupId, NodeId, RaftError, Result, Term};
use skf_store::LogItem;

/// RPC command ids.
pub mod commands {
    pub const RAFT_PING: u32 = 1001;
    pub const RAFT_REQUEST_VOTE: u32 = 1002;
    pub const RAFT_APPEND_ENTRIES: u32 = 1003;
    pub const RAFT_INSTALL_SNAPSHOT: u32 = 1004;
}

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

// ---------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------

pub fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire: u8) {
    put_varint(buf, u64::from(field) << 3 | u64::from(wire));
}

fn put_u64(buf: &mut Vec<u8>, field: u32, v: u64) {
    if v != 0 {
        put_tag(buf, field, WIRE_VARINT);
        put_varint(buf, v);
    }
}

fn put_u32(buf: &mut Vec<u8>, field: u32, v: u32) {
    put_u64(buf, field, u64::from(v));
}

fn put_bool(buf: &mut Vec<u8>, field: u32, v: bool) {
    put_u64(buf, field, u64::from(v));
}

fn put_bytes(buf: &mut Vec<u8>, field: u32, v: &[u8]) {
    if !v.is_empty() {
        put_tag(buf, field, WIRE_LEN);
        put_varint(buf, v.len() as u64);
        buf.extend_from_slice(v);
    }
}

// ---------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------

pub enum WireValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

impl WireValue<'_> {
    fn as_u64(&self) -> u64 {
        match self {
            WireValue::Varint(v) | WireValue::Fixed64(v) => *v,
            WireValue::Fixed32(v) => u64::from(*v),
            WireValue::Bytes(_) => 0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn as_u32(&self) -> u32 {
        self.as_u64() as u32
    }

    fn as_bool(&self) -> bool {
        self.as_u64() != 0
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            WireValue::Bytes(b) => b,
            _ => &[],
        }
    }
}

pub struct PbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PbReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let Some(byte) = self.buf.get(self.pos).copied() else {
                return Err(RaftError::Protocol("varint truncated".into()));
            };
            self.pos += 1;
            if shift >= 64 {
                return Err(RaftError::Protocol("varint too long".into()));
            }
            v |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(RaftError::Protocol("field truncated".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Next `(field_number, value)` pair, or `None` at end of input.
    pub fn next_field(&mut self) -> Result<Option<(u32, WireValue<'a>)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let tag = self.read_varint()?;
        #[allow(clippy::cast_possible_truncation)]
        let field = (tag >> 3) as u32;
        let wire = (tag & 0x7) as u8;
        let value = match wire {
            WIRE_VARINT => WireValue::Varint(self.read_varint()?),
            WIRE_FIXED64 => {
                let b = self.take(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                WireValue::Fixed64(u64::from_le_bytes(arr))
            }
            WIRE_LEN => {
                let len = self.read_varint()?;
                let len = usize::try_from(len)
                    .map_err(|_| RaftError::Protocol("length overflow".into()))?;
                WireValue::Bytes(self.take(len)?)
            }
            WIRE_FIXED32 => {
                let b = self.take(4)?;
                let mut arr = [0u8; 4];
                arr.copy_from_slice(b);
                WireValue::Fixed32(u32::from_le_bytes(arr))
            }
            other => {
                return Err(RaftError::Protocol(format!("unknown wire type {other}")));
            }
        };
        Ok(Some((field, value)))
    }
}

// ---------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingReq {
    pub group_id: GroupId,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingResp {
    pub node_id: NodeId,
    pub group_ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteReq {
    pub group_id: GroupId,
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: Term,
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteResp {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendReq {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: Term,
    pub leader_commit: u64,
    pub entries: Vec<LogItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendResp {
    pub term: Term,
    pub success: bool,
    pub suggested_next_index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSnapshotReq {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: Term,
    pub offset: u64,
    pub done: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSnapshotResp {
    pub term: Term,
    pub success: bool,
}

fn encode_log_item(buf: &mut Vec<u8>, item: &LogItem) {
    let mut body = Vec::with_capacity(item.payload_len() + 48);
    put_u64(&mut body, 1, item.index);
    put_u32(&mut body, 2, item.term);
    put_u32(&mut body, 3, item.prev_log_term);
    put_u64(&mut body, 4, item.timestamp);
    put_u32(&mut body, 5, u32::from(item.item_type));
    put_u32(&mut body, 6, item.biz_type);
    put_bytes(&mut body, 7, &item.header);
    put_bytes(&mut body, 8, &item.body);
    put_tag(buf, 7, WIRE_LEN);
    put_varint(buf, body.len() as u64);
    buf.extend_from_slice(&body);
}

fn decode_log_item(buf: &[u8]) -> Result<LogItem> {
    let mut reader = PbReader::new(buf);
    let mut item = LogItem {
        index: 0,
        term: 0,
        prev_log_term: 0,
        timestamp: 0,
        item_type: 0,
        biz_type: 0,
        header: Bytes::new(),
        body: Bytes::new(),
    };
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => item.index = value.as_u64(),
            2 => item.term = value.as_u32(),
            3 => item.prev_log_term = value.as_u32(),
            4 => item.timestamp = value.as_u64(),
            #[allow(clippy::cast_possible_truncation)]
            5 => item.item_type = value.as_u64() as u8,
            6 => item.biz_type = value.as_u32(),
            7 => item.header = Bytes::copy_from_slice(value.as_bytes()),
            8 => item.body = Bytes::copy_from_slice(value.as_bytes()),
            _ => {}
        }
    }
    Ok(item)
}

impl PingReq {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        put_u32(&mut buf, 1, self.group_id);
        put_u32(&mut buf, 2, self.node_id);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.group_id = value.as_u32(),
                2 => msg.node_id = value.as_u32(),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl PingResp {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        put_u32(&mut buf, 1, self.node_id);
        put_bool(&mut buf, 2, self.group_ready);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.node_id = value.as_u32(),
                2 => msg.group_ready = value.as_bool(),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl VoteReq {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        put_u32(&mut buf, 1, self.group_id);
        put_u32(&mut buf, 2, self.term);
        put_u32(&mut buf, 3, self.candidate_id);
        put_u64(&mut buf, 4, self.last_log_index);
        put_u32(&mut buf, 5, self.last_log_term);
        put_bool(&mut buf, 6, self.pre_vote);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.group_id = value.as_u32(),
                2 => msg.term = value.as_u32(),
                3 => msg.candidate_id = value.as_u32(),
                4 => msg.last_log_index = value.as_u64(),
                5 => msg.last_log_term = value.as_u32(),
                6 => msg.pre_vote = value.as_bool(),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl VoteResp {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        put_u32(&mut buf, 1, self.term);
        put_bool(&mut buf, 2, self.vote_granted);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.term = value.as_u32(),
                2 => msg.vote_granted = value.as_bool(),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl AppendReq {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        put_u32(&mut buf, 1, self.group_id);
        put_u32(&mut buf, 2, self.term);
        put_u32(&mut buf, 3, self.leader_id);
        put_u64(&mut buf, 4, self.prev_log_index);
        put_u32(&mut buf, 5, self.prev_log_term);
        put_u64(&mut buf, 6, self.leader_commit);
        for entry in &self.entries {
            encode_log_item(&mut buf, entry);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.group_id = value.as_u32(),
                2 => msg.term = value.as_u32(),
                3 => msg.leader_id = value.as_u32(),
                4 => msg.prev_log_index = value.as_u64(),
                5 => msg.prev_log_term = value.as_u32(),
                6 => msg.leader_commit = value.as_u64(),
                7 => msg.entries.push(decode_log_item(value.as_bytes())?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl AppendResp {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        put_u32(&mut buf, 1, self.term);
        put_bool(&mut buf, 2, self.success);
        put_u64(&mut buf, 3, self.suggested_next_index);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.term = value.as_u32(),
                2 => msg.success = value.as_bool(),
                3 => msg.suggested_next_index = value.as_u64(),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl InstallSnapshotReq {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.data.len());
        put_u32(&mut buf, 1, self.group_id);
        put_u32(&mut buf, 2, self.term);
        put_u32(&mut buf, 3, self.leader_id);
        put_u64(&mut buf, 4, self.last_included_index);
        put_u32(&mut buf, 5, self.last_included_term);
        put_u64(&mut buf, 6, self.offset);
        put_bool(&mut buf, 7, self.done);
        put_bytes(&mut buf, 8, &self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.group_id = value.as_u32(),
                2 => msg.term = value.as_u32(),
                3 => msg.leader_id = value.as_u32(),
                4 => msg.last_included_index = value.as_u64(),
                5 => msg.last_included_term = value.as_u32(),
                6 => msg.offset = value.as_u64(),
                7 => msg.done = value.as_bool(),
                8 => msg.data = Bytes::copy_from_slice(value.as_bytes()),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl InstallSnapshotResp {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        put_u32(&mut buf, 1, self.term);
        put_bool(&mut buf, 2, self.success);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = PbReader::new(buf);
        let mut msg = Self::default();
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.term = value.as_u32(),
                2 => msg.success = value.as_bool(),
                _ => {}
            }
        }
        Ok(msg)
    }
}

// ---------------------------------------------------------------------
// Request/response envelopes
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    Ping(PingReq),
    Vote(VoteReq),
    Append(AppendReq),
    InstallSnapshot(InstallSnapshotReq),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponse {
    Ping(PingResp),
    Vote(VoteResp),
    Append(AppendResp),
    InstallSnapshot(InstallSnapshotResp),
}

impl RpcRequest {
    #[must_use]
    pub fn command(&self) -> u32 {
        match self {
            RpcRequest::Ping(_) => commands::RAFT_PING,
            RpcRequest::Vote(_) => commands::RAFT_REQUEST_VOTE,
            RpcRequest::Append(_) => commands::RAFT_APPEND_ENTRIES,
            RpcRequest::InstallSnapshot(_) => commands::RAFT_INSTALL_SNAPSHOT,
        }
    }

    #[must_use]
    pub fn group_id(&self) -> GroupId {
        match self {
            RpcRequest::Ping(m) => m.group_id,
            RpcRequest::Vote(m) => m.group_id,
            RpcRequest::Append(m) => m.group_id,
            RpcRequest::InstallSnapshot(m) => m.group_id,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RpcRequest::Ping(m) => m.encode(),
            RpcRequest::Vote(m) => m.encode(),
            RpcRequest::Append(m) => m.encode(),
            RpcRequest::InstallSnapshot(m) => m.encode(),
        }
    }

    pub fn decode(command: u32, buf: &[u8]) -> Result<Self> {
        match command {
            commands::RAFT_PING => Ok(RpcRequest::Ping(PingReq::decode(buf)?)),
            commands::RAFT_REQUEST_VOTE => Ok(RpcRequest::Vote(VoteReq::decode(buf)?)),
            commands::RAFT_APPEND_ENTRIES => Ok(RpcRequest::Append(AppendReq::decode(buf)?)),
            commands::RAFT_INSTALL_SNAPSHOT => Ok(RpcRequest::InstallSnapshot(
                InstallSnapshotReq::decode(buf)?,
            )),
            other => Err(RaftError::Protocol(format!("unknown command {other}"))),
        }
    }
}

impl RpcResponse {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RpcResponse::Ping(m) => m.encode(),
            RpcResponse::Vote(m) => m.encode(),
            RpcResponse::Append(m) => m.encode(),
            RpcResponse::InstallSnapshot(m) => m.encode(),
        }
    }

    pub fn decode(command: u32, buf: &[u8]) -> Result<Self> {
        match command {
            commands::RAFT_PING => Ok(RpcResponse::Ping(PingResp::decode(buf)?)),
            commands::RAFT_REQUEST_VOTE => Ok(RpcResponse::Vote(VoteResp::decode(buf)?)),
            commands::RAFT_APPEND_ENTRIES => Ok(RpcResponse::Append(AppendResp::decode(buf)?)),
            commands::RAFT_INSTALL_SNAPSHOT => Ok(RpcResponse::InstallSnapshot(
                InstallSnapshotResp::decode(buf)?,
            )),
            other => Err(RaftError::Protocol(format!("unknown command {other}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            let mut reader = PbReader::new(&buf);
            assert_eq!(reader.read_varint().unwrap(), v);
        }
    }

    #[test]
    fn test_vote_req_round_trip() {
        let req = VoteReq {
            group_id: 3,
            term: 17,
            candidate_id: 2,
            last_log_index: 456,
            last_log_term: 16,
            pre_vote: true,
        };
        assert_eq!(VoteReq::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_append_req_round_trip_with_entries() {
        let item = LogItem {
            index: 10,
            term: 4,
            prev_log_term: 3,
            timestamp: 1_700_000_000_000,
            item_type: LogItem::TYPE_NORMAL,
            biz_type: 2,
            header: Bytes::from_static(b"h"),
            body: Bytes::from_static(b"set k=v"),
        };
        let req = AppendReq {
            group_id: 1,
            term: 4,
            leader_id: 1,
            prev_log_index: 9,
            prev_log_term: 3,
            leader_commit: 8,
            entries: vec![item.clone(), LogItem { index: 11, prev_log_term: 4, ..item }],
        };
        let decoded = AppendReq::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_append_resp_round_trip() {
        let resp = AppendResp {
            term: 4,
            success: false,
            suggested_next_index: 42,
        };
        assert_eq!(AppendResp::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn test_install_snapshot_round_trip() {
        let req = InstallSnapshotReq {
            group_id: 9,
            term: 2,
            leader_id: 1,
            last_included_index: 100,
            last_included_term: 2,
            offset: 4096,
            done: true,
            data: Bytes::from_static(b"chunk"),
        };
        assert_eq!(InstallSnapshotReq::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_ping_round_trip() {
        let req = PingReq {
            group_id: 1,
            node_id: 3,
        };
        assert_eq!(PingReq::decode(&req.encode()).unwrap(), req);
        let resp = PingResp {
            node_id: 3,
            group_ready: true,
        };
        assert_eq!(PingResp::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn test_envelope_dispatch() {
        let req = RpcRequest::Vote(VoteReq {
            group_id: 1,
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
            pre_vote: false,
        });
        let decoded = RpcRequest::decode(req.command(), &req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1, 7); // group_id
        put_u64(&mut buf, 99, 12345); // unknown field
        put_u32(&mut buf, 2, 3); // node_id
        let msg = PingReq::decode(&buf).unwrap();
        assert_eq!(msg.group_id, 7);
        assert_eq!(msg.node_id, 3);
    }
}
