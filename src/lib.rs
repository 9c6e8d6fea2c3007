//! # RaftKV
//!
//! A replicated key-value store built on Raft consensus:
//! - Leader election and log replication with fast conflict back-off
//! - Crash recovery from atomically persisted state and snapshots
//! - Log compaction with snapshot transfer to lagging followers
//! - Linearizable Get/Put/Append with at-most-once client retries
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Clerk (client library)                      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Get / PutAppend
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     KvServer                                │
//! │          submit ops, wait for apply, snapshot               │
//! └──────────┬──────────────────────────────────▲───────────────┘
//!            │ submit / snapshot                │ ApplyMsg
//! ┌──────────▼──────────────────────────────────┴───────────────┐
//! │                       Raft                                  │
//! │        election · replication · commit · compaction         │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │   Transport     │                │    Persister    │
//!   │ (local / TCP)   │                │ (memory / file) │
//!   └─────────────────┘                └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod kv;
pub mod network;
pub mod persist;
pub mod protocol;
pub mod raft;
pub mod transport;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use error::{KvError, RaftKvError, Result};
pub use kv::{Clerk, KvServer};
pub use raft::Raft;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of RaftKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
