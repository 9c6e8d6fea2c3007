//! Consensus RPC messages and apply messages
//!
//! The request/reply structs follow Figure 2 of the Raft paper, plus an
//! explicit conflict hint on AppendEntries replies and the InstallSnapshot RPC.

use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::NodeId;
use crate::protocol::{MessageKind, WireMessage};

// =============================================================================
// RequestVote
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

// =============================================================================
// AppendEntries
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    /// Empty for a heartbeat
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// On a log mismatch: where the leader should resume sending.
    /// First index of the conflicting term, or one past the follower's log
    /// (or snapshot point) when `prev_log_index` is missing.
    pub conflict_index: u64,
    /// Term found at `prev_log_index`, if the follower had an entry there
    pub conflict_term: Option<u64>,
}

// =============================================================================
// InstallSnapshot
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

// =============================================================================
// Envelopes
// =============================================================================

/// Any consensus RPC a node can receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

impl RpcRequest {
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::RequestVote(_) => "RequestVote",
            RpcRequest::AppendEntries(_) => "AppendEntries",
            RpcRequest::InstallSnapshot(_) => "InstallSnapshot",
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            RpcRequest::RequestVote(args) => args.term,
            RpcRequest::AppendEntries(args) => args.term,
            RpcRequest::InstallSnapshot(args) => args.term,
        }
    }
}

impl WireMessage for RpcRequest {
    const KIND: MessageKind = MessageKind::RpcRequest;
}

/// Reply to an [`RpcRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotReply),
}

impl WireMessage for RpcReply {
    const KIND: MessageKind = MessageKind::RpcReply;
}

// =============================================================================
// Apply Pipeline
// =============================================================================

/// Message delivered from the engine to its service, in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed log entry
    CommandApplied { index: u64, term: u64, command: Vec<u8> },

    /// A snapshot installed from the leader; replaces all state up to `index`
    SnapshotInstalled { index: u64, term: u64, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::CommandApplied { index, .. } => *index,
            ApplyMsg::SnapshotInstalled { index, .. } => *index,
        }
    }
}
