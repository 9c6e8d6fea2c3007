//! Replicated KV state machine
//!
//! Holds everything the service rebuilds from the log: the key/value map,
//! the highest applied sequence number per client, and the log index the
//! state reflects. The whole struct is the snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::op::{ClientId, Op, OpKind};
use crate::error::Result;
use crate::protocol::{self, MessageKind, WireMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvState {
    store: BTreeMap<String, String>,
    last_sequence: BTreeMap<ClientId, u64>,
    applied_index: u64,
}

impl WireMessage for KvState {
    const KIND: MessageKind = MessageKind::KvSnapshot;
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the op committed at `index`
    ///
    /// Returns `false` when the op is a duplicate of one already applied for
    /// its client; the index still advances.
    pub fn apply(&mut self, index: u64, op: &Op) -> bool {
        if index > self.applied_index {
            self.applied_index = index;
        }
        if self.is_applied(op.client_id, op.sequence_num) {
            return false;
        }
        self.last_sequence.insert(op.client_id, op.sequence_num);
        match op.kind {
            OpKind::Get => {}
            OpKind::Put => {
                self.store.insert(op.key.clone(), op.value.clone());
            }
            OpKind::Append => {
                self.store
                    .entry(op.key.clone())
                    .or_default()
                    .push_str(&op.value);
            }
        }
        true
    }

    /// Advance the index for a committed entry that carries no usable op
    pub fn skip(&mut self, index: u64) {
        if index > self.applied_index {
            self.applied_index = index;
        }
    }

    /// Whether `client`'s op `sequence_num` (or a later one) has been applied
    pub fn is_applied(&self, client: ClientId, sequence_num: u64) -> bool {
        self.last_sequence(client) >= sequence_num
    }

    pub fn last_sequence(&self, client: ClientId) -> u64 {
        self.last_sequence.get(&client).copied().unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.store.get(key).map(String::as_str)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn to_snapshot(&self) -> Result<Vec<u8>> {
        protocol::encode(self)
    }

    /// Rebuild from snapshot bytes; empty bytes mean "no snapshot yet"
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        protocol::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OpKind, key: &str, value: &str, client_id: ClientId, sequence_num: u64) -> Op {
        Op {
            kind,
            key: key.to_string(),
            value: value.to_string(),
            client_id,
            sequence_num,
        }
    }

    #[test]
    fn test_append_concatenates() {
        let mut kv = KvState::new();
        kv.apply(1, &op(OpKind::Append, "a", "b", 1, 1));
        kv.apply(2, &op(OpKind::Append, "a", "c", 1, 2));
        assert_eq!(kv.get("a"), Some("bc"));
        assert_eq!(kv.applied_index(), 2);
    }

    #[test]
    fn test_duplicate_put_applied_once() {
        let mut kv = KvState::new();
        let put = op(OpKind::Append, "x", "1", 7, 1);
        assert!(kv.apply(1, &put));
        // The same op committed a second time after a client retry
        assert!(!kv.apply(2, &put));
        assert_eq!(kv.get("x"), Some("1"));
        assert_eq!(kv.applied_index(), 2);
    }

    #[test]
    fn test_stale_sequence_ignored() {
        let mut kv = KvState::new();
        kv.apply(1, &op(OpKind::Put, "k", "new", 3, 5));
        assert!(!kv.apply(2, &op(OpKind::Put, "k", "old", 3, 4)));
        assert_eq!(kv.get("k"), Some("new"));
        assert!(kv.is_applied(3, 5));
        assert!(!kv.is_applied(3, 6));
    }

    #[test]
    fn test_get_records_sequence_without_mutation() {
        let mut kv = KvState::new();
        assert!(kv.apply(1, &op(OpKind::Get, "missing", "", 9, 1)));
        assert_eq!(kv.get("missing"), None);
        assert_eq!(kv.last_sequence(9), 1);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut kv = KvState::new();
        kv.apply(1, &op(OpKind::Put, "a", "1", 1, 1));
        kv.apply(2, &op(OpKind::Append, "a", "2", 2, 1));
        kv.apply(3, &op(OpKind::Put, "b", "x", 1, 2));

        let restored = KvState::from_snapshot(&kv.to_snapshot().unwrap()).unwrap();
        assert_eq!(restored, kv);
        assert_eq!(restored.applied_index(), 3);
        assert_eq!(KvState::from_snapshot(&[]).unwrap(), KvState::new());
    }
}
