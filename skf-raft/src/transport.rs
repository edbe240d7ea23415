//! Transport seam.
//!
//! The engine never owns sockets. Outbound requests go through
//! [`RaftTransport`]; the real implementation frames and pools
//! connections, tests use an in-process loopback. Inbound requests are
//! handed to a [`RequestHandler`] (the server), which routes them into
//! the owning group's channel and answers through the reply completer.

use skf_core::NodeId;
use skf_fiber::{FiberFuture, FutureCompleter};

use crate::codec::{RpcRequest, RpcResponse};

pub trait RaftTransport: Send + Sync + 'static {
    /// Send a request; the returned future completes with the peer's
    /// response or the transport error. Callers bound it with a
    /// deadline.
    fn send(&self, to: NodeId, request: RpcRequest) -> FiberFuture<RpcResponse>;
}

/// Server side of the transport: decoded requests enter here.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, from: NodeId, request: RpcRequest, reply: FutureCompleter<RpcResponse>);
}

/// A decoded inbound request queued to its group.
pub struct IncomingRequest {
    pub from: NodeId,
    pub request: RpcRequest,
    pub reply: FutureCompleter<RpcResponse>,
}
