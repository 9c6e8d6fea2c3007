//! Request definitions
//!
//! Everything a TCP peer or client can send to a node.

use serde::{Deserialize, Serialize};

use super::{MessageKind, WireMessage};
use crate::kv::{GetArgs, PutAppendArgs};
use crate::raft::RpcRequest;

/// A request arriving on the TCP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Consensus RPC from another node
    Raft(RpcRequest),

    /// Client read
    Get(GetArgs),

    /// Client write (put or append)
    PutAppend(PutAppendArgs),

    /// Health check
    Ping,
}

impl WireMessage for Request {
    const KIND: MessageKind = MessageKind::Request;
}

impl Request {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::Raft(rpc) => rpc.name(),
            Request::Get(_) => "Get",
            Request::PutAppend(_) => "PutAppend",
            Request::Ping => "Ping",
        }
    }
}
