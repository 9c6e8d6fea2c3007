//! Persistence Module
//!
//! Durable home of a node's raft state and its service snapshot.
//!
//! ## Guarantees
//! - `save_state_and_snapshot` replaces both blobs as one unit; after a
//!   crash a reader sees either the old pair or the new pair
//! - `read_*` on a fresh persister returns empty bytes
//!
//! ## File Layout (FilePersister)
//! ```text
//! {dir}/raft.state                    rewritten on every save
//! ┌─────────┬─────────┬───────────────┬─────────┬─────────┬────────────────┐
//! │ CRC (4) │ Len (4) │ state bytes   │ CRC (4) │ Len (4) │ generation (8) │
//! └─────────┴─────────┴───────────────┴─────────┴─────────┴────────────────┘
//!
//! {dir}/snapshot-{generation}         written only when compacting
//! ┌─────────┬─────────┬────────────────┐
//! │ CRC (4) │ Len (4) │ snapshot bytes │
//! └─────────┴─────────┴────────────────┘
//! ```

mod file;
mod memory;
mod record;

pub use file::FilePersister;
pub use memory::MemoryPersister;

use crate::error::Result;

/// Storage for raft state and snapshot bytes
pub trait Persister: Send + Sync {
    /// Replace the raft state, keeping the current snapshot
    fn save_state(&self, state: &[u8]) -> Result<()>;

    fn read_state(&self) -> Result<Vec<u8>>;

    /// Replace raft state and snapshot atomically
    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()>;

    fn read_snapshot(&self) -> Result<Vec<u8>>;

    /// Size in bytes of the raft state blob
    fn state_size(&self) -> usize;
}
