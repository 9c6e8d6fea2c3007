//! Error types for RaftKV
//!
//! Two layers:
//! - [`RaftKvError`]: internal failures (I/O, encoding, corrupted state)
//! - [`KvError`]: the only failures a KV client ever sees

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using RaftKvError
pub type Result<T> = std::result::Result<T, RaftKvError>;

/// Unified error type for RaftKV internals
#[derive(Debug, Error)]
pub enum RaftKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Persistence Errors
    // -------------------------------------------------------------------------
    #[error("Persisted state is corrupt: {0}")]
    CorruptState(String),

    #[error("Persist failed: {0}")]
    Persist(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Node has been shut down")]
    Killed,
}

impl From<bincode::Error> for RaftKvError {
    fn from(err: bincode::Error) -> Self {
        RaftKvError::Serialization(err.to_string())
    }
}

/// Errors returned to KV clients
///
/// Every variant is retryable against some node; the client must resend the
/// same (client id, sequence number) pair so the retry stays idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KvError {
    /// This node is not the leader; try another one
    #[error("wrong leader")]
    WrongLeader,

    /// The operation was not observed as applied in time
    #[error("timed out waiting for the operation to commit")]
    Timeout,

    /// This node has been shut down or cannot be reached
    #[error("server is dead")]
    ServerDead,
}

impl KvError {
    /// Whether the same node is worth retrying
    ///
    /// A timed-out leader may still be leader; the other kinds point elsewhere.
    pub fn retry_same_node(&self) -> bool {
        matches!(self, KvError::Timeout)
    }
}
