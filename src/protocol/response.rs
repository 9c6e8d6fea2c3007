//! Response definitions
//!
//! Replies written back on the TCP connection.

use serde::{Deserialize, Serialize};

use super::{MessageKind, WireMessage};
use crate::error::KvError;
use crate::raft::RpcReply;

/// A response to a [`super::Request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Reply to a consensus RPC
    Raft(RpcReply),

    /// Value for a Get; `Ok(None)` means the key does not exist
    Get(Result<Option<String>, KvError>),

    /// Outcome of a Put/Append
    PutAppend(Result<(), KvError>),

    /// Reply to Ping
    Pong,

    /// The node could not process the request (e.g. engine I/O failure)
    Unavailable(String),
}

impl WireMessage for Response {
    const KIND: MessageKind = MessageKind::Response;
}
