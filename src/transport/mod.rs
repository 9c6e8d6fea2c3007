//! Transport Module
//!
//! How a Raft node reaches its peers. The engine only sees [`Transport`];
//! an inbound request is handed to whatever [`RpcHandler`] is registered for
//! the destination.
//!
//! ## Implementations
//! - [`LocalNetwork`]: in-process, with partitions and unreliable delivery,
//!   used by tests and benches
//! - `network::TcpTransport`: framed requests over TCP between processes

mod local;

pub use local::{LocalNetwork, LocalTransport};

use crate::error::Result;
use crate::raft::{NodeId, RpcReply, RpcRequest};

/// Outbound side of consensus RPC
pub trait Transport: Send + Sync {
    /// Send `request` to `peer` and wait for its reply
    ///
    /// `None` means the call failed: the peer is unreachable, dropped the
    /// request, or the reply was lost. The caller treats it as "no answer".
    fn call(&self, peer: NodeId, request: RpcRequest) -> Option<RpcReply>;
}

/// Inbound side of consensus RPC
pub trait RpcHandler: Send + Sync {
    /// Process one request
    ///
    /// An `Err` means no reply may be sent (node shut down, or the state
    /// change could not be persisted).
    fn handle(&self, request: RpcRequest) -> Result<RpcReply>;
}
