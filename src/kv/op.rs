//! KV commands and client arguments

use serde::{Deserialize, Serialize};

use crate::protocol::{MessageKind, WireMessage};

/// Client identifier, unique per client library instance
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

/// A client operation as carried inside a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub key: String,
    /// Empty for Get
    pub value: String,
    pub client_id: ClientId,
    /// Per-client, strictly increasing; the deduplication key
    pub sequence_num: u64,
}

impl WireMessage for Op {
    const KIND: MessageKind = MessageKind::KvOp;
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: ClientId,
    pub sequence_num: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutMode {
    Put,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub mode: PutMode,
    pub client_id: ClientId,
    pub sequence_num: u64,
}

impl From<&GetArgs> for Op {
    fn from(args: &GetArgs) -> Self {
        Op {
            kind: OpKind::Get,
            key: args.key.clone(),
            value: String::new(),
            client_id: args.client_id,
            sequence_num: args.sequence_num,
        }
    }
}

impl From<&PutAppendArgs> for Op {
    fn from(args: &PutAppendArgs) -> Self {
        let kind = match args.mode {
            PutMode::Put => OpKind::Put,
            PutMode::Append => OpKind::Append,
        };
        Op {
            kind,
            key: args.key.clone(),
            value: args.value.clone(),
            client_id: args.client_id,
            sequence_num: args.sequence_num,
        }
    }
}
