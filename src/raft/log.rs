//! Replicated log with a snapshot prefix
//!
//! Entries with index ≤ `last_included_index` have been folded into the most
//! recent snapshot and are physically gone; the snapshot point itself acts as
//! the sentinel entry (index 0 / term 0 before any compaction).

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the leader created this entry
    pub term: u64,

    /// Position in the log (1-based)
    pub index: u64,

    /// Encoded service command, opaque to the engine
    pub command: Vec<u8>,
}

/// In-memory log: a vector of live entries plus the snapshot point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    last_included_index: u64,
    last_included_term: u64,
}

impl RaftLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted parts
    pub fn restore(entries: Vec<LogEntry>, last_included_index: u64, last_included_term: u64) -> Self {
        Self {
            entries,
            last_included_index,
            last_included_term,
        }
    }

    pub fn last_included_index(&self) -> u64 {
        self.last_included_index
    }

    pub fn last_included_term(&self) -> u64 {
        self.last_included_term
    }

    /// Index of the last entry, or the snapshot point if none are live
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.last_included_index)
    }

    /// Term of the last entry, or the snapshot term if none are live
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.last_included_term)
    }

    /// Number of live (uncompacted) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term at `index`
    ///
    /// Returns `None` when the index was compacted away (below the snapshot
    /// point) or lies beyond the end of the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.last_included_index {
            return Some(self.last_included_term);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Live entry at `index`
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.last_included_index {
            return None;
        }
        let offset = (index - self.last_included_index - 1) as usize;
        self.entries.get(offset)
    }

    /// Clone every live entry from `index` to the end
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = index.max(self.last_included_index + 1);
        if start > self.last_index() {
            return Vec::new();
        }
        let offset = (start - self.last_included_index - 1) as usize;
        self.entries[offset..].to_vec()
    }

    /// Clone entries in `from..=to` (clamped to the live range)
    pub fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let start = from.max(self.last_included_index + 1);
        let end = to.min(self.last_index());
        if start > end {
            return Vec::new();
        }
        let lo = (start - self.last_included_index - 1) as usize;
        let hi = (end - self.last_included_index) as usize;
        self.entries[lo..hi].to_vec()
    }

    /// Append a new command at the next index
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    /// Remove `index` and everything after it
    ///
    /// Never touches compacted entries.
    pub fn truncate_from(&mut self, index: u64) {
        if index <= self.last_included_index {
            self.entries.clear();
            return;
        }
        let offset = (index - self.last_included_index - 1) as usize;
        self.entries.truncate(offset);
    }

    /// Splice leader entries into the log
    ///
    /// Entries already present with the same term are kept; the first entry
    /// whose term disagrees truncates the local suffix from that point. An
    /// all-matching (possibly stale, reordered) batch never shortens the log.
    ///
    /// Returns `true` if the log changed.
    pub fn merge(&mut self, incoming: &[LogEntry]) -> bool {
        let mut changed = false;
        for (pos, entry) in incoming.iter().enumerate() {
            if entry.index <= self.last_included_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.entries.extend_from_slice(&incoming[pos..]);
                    return true;
                }
                None => {
                    self.entries.extend_from_slice(&incoming[pos..]);
                    changed = true;
                    break;
                }
            }
        }
        changed
    }

    /// First live index carrying `term`, scanning back from `from`
    ///
    /// Used for the AppendEntries conflict hint: the leader can skip the
    /// whole conflicting term instead of backing off one index at a time.
    pub fn first_index_of_term(&self, term: u64, from: u64) -> u64 {
        let mut index = from;
        while index > self.last_included_index + 1 {
            match self.term_at(index - 1) {
                Some(t) if t == term => index -= 1,
                _ => break,
            }
        }
        index
    }

    /// Last live index carrying `term`, if any
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Whether a candidate log ending at (`last_term`, `last_index`) is at
    /// least as up-to-date as this one
    pub fn is_up_to_date(&self, last_term: u64, last_index: u64) -> bool {
        let my_term = self.last_term();
        last_term > my_term || (last_term == my_term && last_index >= self.last_index())
    }

    /// Fold everything up to and including `index` into the snapshot point
    ///
    /// No-op (returns `false`) if `index` is already compacted or beyond the
    /// end of the log.
    pub fn compact_to(&mut self, index: u64) -> bool {
        if index <= self.last_included_index || index > self.last_index() {
            return false;
        }
        let term = match self.term_at(index) {
            Some(term) => term,
            None => return false,
        };
        let keep_from = (index - self.last_included_index) as usize;
        self.entries.drain(..keep_from);
        self.last_included_index = index;
        self.last_included_term = term;
        true
    }

    /// Reset the snapshot point to a snapshot received from the leader
    ///
    /// If the log holds an entry matching (`index`, `term`) the suffix after
    /// it is retained; otherwise the whole log is discarded.
    pub fn install_snapshot(&mut self, index: u64, term: u64) {
        if self.term_at(index) == Some(term) && index > self.last_included_index {
            let keep_from = (index - self.last_included_index) as usize;
            self.entries.drain(..keep_from);
        } else {
            self.entries.clear();
        }
        self.last_included_index = index;
        self.last_included_term = term;
    }
}
