//! Raft Consensus Module
//!
//! Leader election, log replication, commitment, persistence and log
//! compaction for one node of a statically configured cluster.
//!
//! ## Architecture
//! ```text
//!   ┌───────────────┐  ┌───────────────┐  ┌─────────────────────┐
//!   │ election timer│  │ replicator ×N │  │ RPC handlers        │
//!   │  (1 thread)   │  │ (1 per peer)  │  │ (transport threads) │
//!   └───────┬───────┘  └───────┬───────┘  └──────────┬──────────┘
//!           │                  │                     │
//!           └──────────┬───────┴─────────────────────┘
//!                      ▼
//!          ┌────────────────────────┐      save / read
//!          │ Mutex<RaftState>       │ ───────────────────▶ Persister
//!          └───────────┬────────────┘
//!                      │ apply_cond
//!                      ▼
//!          ┌────────────────────────┐   bounded channel
//!          │ applier (1 thread)     │ ───────────────────▶ service
//!          └────────────────────────┘      ApplyMsg
//! ```
//!
//! All threads share one lock. Network I/O always happens with the lock
//! released; replies are re-validated against the current term on return.

mod log;
mod message;
mod node;
mod state;
mod timer;

pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply, RpcReply, RpcRequest,
};
pub use node::{apply_channel, Proposal, Raft};
pub use state::{PersistNeed, PersistentState, RaftState, Role, Status};
pub use timer::ElectionTimer;

/// Index of a node in the cluster's peer list
pub type NodeId = usize;
