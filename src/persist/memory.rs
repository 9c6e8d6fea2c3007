//! In-memory persister
//!
//! Survives a node "crash" as long as the harness keeps a copy around.

use parking_lot::Mutex;

use super::Persister;
use crate::error::Result;

#[derive(Debug, Default, Clone)]
struct Blobs {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// Persister backed by process memory
#[derive(Debug, Default)]
pub struct MemoryPersister {
    blobs: Mutex<Blobs>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent persister holding the same bytes
    ///
    /// Used to restart a node: the old instance may keep writing to its
    /// own copy without affecting the new one.
    pub fn copy(&self) -> Self {
        Self {
            blobs: Mutex::new(self.blobs.lock().clone()),
        }
    }

    pub fn snapshot_size(&self) -> usize {
        self.blobs.lock().snapshot.len()
    }
}

impl Persister for MemoryPersister {
    fn save_state(&self, state: &[u8]) -> Result<()> {
        self.blobs.lock().state = state.to_vec();
        Ok(())
    }

    fn read_state(&self) -> Result<Vec<u8>> {
        Ok(self.blobs.lock().state.clone())
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock();
        blobs.state = state.to_vec();
        blobs.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.blobs.lock().snapshot.clone())
    }

    fn state_size(&self) -> usize {
        self.blobs.lock().state.len()
    }
}
