//! Consensus state and protocol rules
//!
//! [`RaftState`] is the single block of mutable state a node keeps behind its
//! lock. Every method here is synchronous and does no I/O: the node layer
//! takes the lock, calls one of these, persists whatever was marked dirty,
//! and only then releases the lock and talks to the network.
//!
//! ## Role Transitions
//! ```text
//!                 timeout               majority of votes
//!   ┌──────────┐ ─────────▶ ┌───────────┐ ─────────────▶ ┌────────┐
//!   │ Follower │            │ Candidate │                │ Leader │
//!   └──────────┘ ◀───────── └───────────┘                └────────┘
//!        ▲       higher term /    │ timeout: new term         │
//!        │       leader heartbeat └───────────┘               │
//!        └────────────────────── higher term ─────────────────┘
//! ```

use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::log::RaftLog;
use super::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply, RpcRequest,
};
use super::timer::ElectionTimer;
use super::NodeId;
use crate::protocol::{MessageKind, WireMessage};

/// Upper bound on entries shipped in a single AppendEntries
pub const MAX_ENTRIES_PER_APPEND: usize = 256;

/// Upper bound on committed entries handed to the applier per batch
pub const MAX_APPLY_BATCH: usize = 128;

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// State that must reach stable storage before the node acts on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
}

impl WireMessage for PersistentState {
    const KIND: MessageKind = MessageKind::PersistentState;
}

/// What has changed since the last persist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistNeed {
    Clean,
    State,
    StateAndSnapshot,
}

/// Point-in-time view of a node, for callers and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub me: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader_hint: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_included_index: u64,
}

#[derive(Debug, Clone)]
struct PendingSnapshot {
    index: u64,
    term: u64,
    data: Vec<u8>,
}

/// All consensus state of one node
#[derive(Debug)]
pub struct RaftState {
    me: NodeId,
    cluster_size: usize,

    // -------------------------------------------------------------------------
    // Persistent
    // -------------------------------------------------------------------------
    current_term: u64,
    voted_for: Option<NodeId>,
    log: RaftLog,
    snapshot: Vec<u8>,

    // -------------------------------------------------------------------------
    // Volatile
    // -------------------------------------------------------------------------
    role: Role,
    commit_index: u64,
    last_applied: u64,
    election_deadline: Instant,
    leader_hint: Option<NodeId>,
    votes: Vec<bool>,
    pending_snapshot: Option<PendingSnapshot>,
    persist: PersistNeed,
    timer: ElectionTimer,

    // -------------------------------------------------------------------------
    // Leader only (re-initialized on every election win)
    // -------------------------------------------------------------------------
    next_index: Vec<u64>,
    match_index: Vec<u64>,
}

impl RaftState {
    /// Fresh follower at term 0 with an empty log
    pub fn new(me: NodeId, cluster_size: usize, mut timer: ElectionTimer, now: Instant) -> Self {
        let election_deadline = timer.next_deadline(now);
        Self {
            me,
            cluster_size,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            snapshot: Vec::new(),
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            election_deadline,
            leader_hint: None,
            votes: vec![false; cluster_size],
            pending_snapshot: None,
            persist: PersistNeed::Clean,
            timer,
            next_index: vec![1; cluster_size],
            match_index: vec![0; cluster_size],
        }
    }

    /// Load state recovered from the persister
    ///
    /// Everything up to the snapshot point is already reflected in the
    /// service's snapshot, so it counts as committed and applied.
    pub fn restore(&mut self, persisted: PersistentState, snapshot: Vec<u8>) {
        self.current_term = persisted.current_term;
        self.voted_for = persisted.voted_for;
        self.log = persisted.log;
        self.snapshot = snapshot;
        self.commit_index = self.log.last_included_index();
        self.last_applied = self.log.last_included_index();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn me(&self) -> NodeId {
        self.me
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn snapshot(&self) -> &[u8] {
        &self.snapshot
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    pub fn status(&self) -> Status {
        Status {
            me: self.me,
            role: self.role,
            term: self.current_term,
            leader_hint: self.leader_hint,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            last_included_index: self.log.last_included_index(),
        }
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// Return and clear the pending persistence requirement
    pub fn take_persist_need(&mut self) -> PersistNeed {
        std::mem::replace(&mut self.persist, PersistNeed::Clean)
    }

    /// Put back a persistence requirement that could not be satisfied
    pub fn restore_persist_need(&mut self, need: PersistNeed) {
        match need {
            PersistNeed::Clean => {}
            PersistNeed::State => self.mark_state(),
            PersistNeed::StateAndSnapshot => self.mark_snapshot(),
        }
    }

    fn mark_state(&mut self) {
        if self.persist == PersistNeed::Clean {
            self.persist = PersistNeed::State;
        }
    }

    fn mark_snapshot(&mut self) {
        self.persist = PersistNeed::StateAndSnapshot;
    }

    fn majority(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    // =========================================================================
    // Role Transitions
    // =========================================================================

    fn reset_election_deadline(&mut self, now: Instant) {
        self.election_deadline = self.timer.next_deadline(now);
    }

    /// Adopt `term` (if newer) and fall back to follower
    fn become_follower(&mut self, term: u64, now: Instant) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_hint = None;
            self.mark_state();
        }
        if self.role != Role::Follower {
            tracing::info!(node = self.me, term = self.current_term, from = ?self.role, "stepping down to follower");
            self.role = Role::Follower;
            self.reset_election_deadline(now);
        }
    }

    fn become_leader(&mut self, now: Instant) {
        tracing::info!(node = self.me, term = self.current_term, "became leader");
        self.role = Role::Leader;
        self.leader_hint = Some(self.me);
        let next = self.log.last_index() + 1;
        self.next_index = vec![next; self.cluster_size];
        self.match_index = vec![0; self.cluster_size];
        self.match_index[self.me] = self.log.last_index();
        self.reset_election_deadline(now);
    }

    /// Start a new election: bump the term and vote for ourselves
    ///
    /// Returns the RequestVote arguments to send to every peer. A single-node
    /// cluster wins immediately.
    pub fn start_election(&mut self, now: Instant) -> RequestVoteArgs {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.me);
        self.leader_hint = None;
        self.votes = vec![false; self.cluster_size];
        self.votes[self.me] = true;
        self.mark_state();
        self.reset_election_deadline(now);

        tracing::info!(node = self.me, term = self.current_term, "starting election");

        if self.majority() <= 1 {
            self.become_leader(now);
        }

        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.me,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    // =========================================================================
    // RPC Receivers
    // =========================================================================

    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs, now: Instant) -> RequestVoteReply {
        if args.term < self.current_term {
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            };
        }
        if args.term > self.current_term {
            self.become_follower(args.term, now);
        }

        let free_to_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let up_to_date = self
            .log
            .is_up_to_date(args.last_log_term, args.last_log_index);

        let vote_granted = free_to_vote && up_to_date;
        if vote_granted {
            self.voted_for = Some(args.candidate_id);
            self.mark_state();
            self.reset_election_deadline(now);
            tracing::debug!(node = self.me, candidate = args.candidate_id, term = args.term, "granted vote");
        }

        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs, now: Instant) -> AppendEntriesReply {
        let mut reply = AppendEntriesReply {
            term: self.current_term,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        };
        if args.term < self.current_term {
            return reply;
        }

        self.become_follower(args.term, now);
        self.leader_hint = Some(args.leader_id);
        self.reset_election_deadline(now);
        reply.term = self.current_term;

        let prev = args.prev_log_index;
        if prev < self.log.last_included_index() {
            reply.conflict_index = self.log.last_included_index() + 1;
            return reply;
        }
        if prev > self.log.last_index() {
            reply.conflict_index = self.log.last_index() + 1;
            return reply;
        }
        match self.log.term_at(prev) {
            Some(term) if term == args.prev_log_term => {}
            Some(term) => {
                reply.conflict_term = Some(term);
                reply.conflict_index = self.log.first_index_of_term(term, prev);
                tracing::debug!(node = self.me, prev, term, conflict = reply.conflict_index, "log mismatch");
                return reply;
            }
            None => {
                reply.conflict_index = self.log.last_included_index() + 1;
                return reply;
            }
        }

        if self.log.merge(&args.entries) {
            self.mark_state();
        }

        let last_new = prev + args.entries.len() as u64;
        if args.leader_commit > self.commit_index {
            let target = args.leader_commit.min(last_new);
            if target > self.commit_index {
                self.commit_index = target;
            }
        }

        reply.success = true;
        reply
    }

    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs, now: Instant) -> InstallSnapshotReply {
        if args.term < self.current_term {
            return InstallSnapshotReply {
                term: self.current_term,
            };
        }

        self.become_follower(args.term, now);
        self.leader_hint = Some(args.leader_id);
        self.reset_election_deadline(now);

        if args.last_included_index <= self.commit_index {
            return InstallSnapshotReply {
                term: self.current_term,
            };
        }

        tracing::info!(
            node = self.me,
            index = args.last_included_index,
            term = args.last_included_term,
            "installing snapshot from leader"
        );

        self.log
            .install_snapshot(args.last_included_index, args.last_included_term);
        self.snapshot = args.data.clone();
        self.commit_index = args.last_included_index;
        self.pending_snapshot = Some(PendingSnapshot {
            index: args.last_included_index,
            term: args.last_included_term,
            data: args.data.clone(),
        });
        self.mark_snapshot();

        InstallSnapshotReply {
            term: self.current_term,
        }
    }

    // =========================================================================
    // RPC Reply Processing (caller side)
    // =========================================================================

    /// Count a vote reply; returns `true` if it made us leader
    pub fn handle_vote_reply(&mut self, peer: NodeId, sent_term: u64, reply: &RequestVoteReply, now: Instant) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term, now);
            return false;
        }
        if self.role != Role::Candidate || self.current_term != sent_term || !reply.vote_granted {
            return false;
        }

        self.votes[peer] = true;
        let granted = self.votes.iter().filter(|v| **v).count();
        if granted >= self.majority() {
            self.become_leader(now);
            return true;
        }
        false
    }

    /// Update replication progress; returns `true` if the commit index moved
    pub fn handle_append_reply(&mut self, peer: NodeId, sent: &AppendEntriesArgs, reply: &AppendEntriesReply, now: Instant) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term, now);
            return false;
        }
        if self.role != Role::Leader || self.current_term != sent.term {
            return false;
        }

        if reply.success {
            let matched = sent.prev_log_index + sent.entries.len() as u64;
            if matched > self.match_index[peer] {
                self.match_index[peer] = matched;
            }
            if matched + 1 > self.next_index[peer] {
                self.next_index[peer] = matched + 1;
            }
            return self.advance_commit();
        }

        let mut next = match reply.conflict_term {
            Some(term) => match self.log.last_index_of_term(term) {
                Some(last) => last + 1,
                None => reply.conflict_index,
            },
            None => reply.conflict_index,
        };
        next = next
            .max(self.match_index[peer] + 1)
            .min(self.log.last_index() + 1)
            .max(1);
        tracing::debug!(node = self.me, peer, from = self.next_index[peer], to = next, "backing off next index");
        self.next_index[peer] = next;
        false
    }

    pub fn handle_snapshot_reply(&mut self, peer: NodeId, sent: &InstallSnapshotArgs, reply: &InstallSnapshotReply, now: Instant) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term, now);
            return false;
        }
        if self.role != Role::Leader || self.current_term != sent.term {
            return false;
        }
        if sent.last_included_index > self.match_index[peer] {
            self.match_index[peer] = sent.last_included_index;
        }
        if self.match_index[peer] + 1 > self.next_index[peer] {
            self.next_index[peer] = self.match_index[peer] + 1;
        }
        self.advance_commit()
    }

    /// Raise the commit index to the highest current-term entry stored on a
    /// majority. Entries from earlier terms only commit underneath it.
    fn advance_commit(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let majority = self.majority();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            match self.log.term_at(n) {
                Some(term) if term == self.current_term => {
                    let replicas = self.match_index.iter().filter(|&&m| m >= n).count();
                    if replicas >= majority {
                        tracing::trace!(node = self.me, from = self.commit_index, to = n, "advancing commit index");
                        self.commit_index = n;
                        return true;
                    }
                }
                _ => break,
            }
            n -= 1;
        }
        false
    }

    // =========================================================================
    // Leader Replication
    // =========================================================================

    /// Build the next request for `peer`, or `None` if we are not leader
    ///
    /// Falls back to InstallSnapshot when the entries the peer needs have
    /// already been compacted.
    pub fn replication_request(&self, peer: NodeId) -> Option<RpcRequest> {
        if self.role != Role::Leader {
            return None;
        }
        let next = self.next_index[peer].max(1);
        let prev = next - 1;

        if next <= self.log.last_included_index() {
            return Some(self.snapshot_request());
        }
        let prev_log_term = match self.log.term_at(prev) {
            Some(term) => term,
            None => return Some(self.snapshot_request()),
        };

        let last = (prev + MAX_ENTRIES_PER_APPEND as u64).min(self.log.last_index());
        Some(RpcRequest::AppendEntries(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.me,
            prev_log_index: prev,
            prev_log_term,
            entries: self.log.entries_between(next, last),
            leader_commit: self.commit_index,
        }))
    }

    fn snapshot_request(&self) -> RpcRequest {
        RpcRequest::InstallSnapshot(InstallSnapshotArgs {
            term: self.current_term,
            leader_id: self.me,
            last_included_index: self.log.last_included_index(),
            last_included_term: self.log.last_included_term(),
            data: self.snapshot.clone(),
        })
    }

    /// Whether `peer` is missing entries we hold
    pub fn peer_lagging(&self, peer: NodeId) -> bool {
        self.role == Role::Leader && self.next_index[peer] <= self.log.last_index()
    }

    // =========================================================================
    // Service Interface
    // =========================================================================

    /// Append a command if leader; returns (index, term)
    pub fn submit(&mut self, command: Vec<u8>) -> Option<(u64, u64)> {
        if self.role != Role::Leader {
            return None;
        }
        let index = self.log.append(self.current_term, command);
        self.match_index[self.me] = index;
        self.next_index[self.me] = index + 1;
        self.mark_state();
        Some((index, self.current_term))
    }

    /// Commit whatever the leader's own durable log now makes a majority
    ///
    /// Only matters when the leader alone is a majority; call it once the
    /// submitted entry is on stable storage.
    pub fn commit_local(&mut self) -> bool {
        self.advance_commit()
    }

    /// Undo a `submit` whose entry could not be persisted
    pub fn retract(&mut self, index: u64) {
        if self.log.last_index() == index && index > self.commit_index {
            self.log.truncate_from(index);
            self.match_index[self.me] = self.log.last_index();
            self.next_index[self.me] = self.log.last_index() + 1;
        }
    }

    /// Compact the log through `index` using the service's snapshot bytes
    ///
    /// Ignored unless `index` is newer than the current snapshot point and
    /// already applied.
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> bool {
        if index <= self.log.last_included_index() || index > self.last_applied {
            return false;
        }
        if !self.log.compact_to(index) {
            return false;
        }
        tracing::debug!(node = self.me, index, live = self.log.len(), "compacted log");
        self.snapshot = data;
        self.mark_snapshot();
        true
    }

    // =========================================================================
    // Apply Pipeline
    // =========================================================================

    pub fn has_apply_work(&self) -> bool {
        self.pending_snapshot.is_some() || self.last_applied < self.commit_index
    }

    /// Take the next batch of messages for the service
    ///
    /// A pending installed snapshot always goes first and jumps
    /// `last_applied` forward; otherwise committed entries follow in order.
    pub fn take_apply_batch(&mut self) -> Vec<ApplyMsg> {
        if let Some(snap) = self.pending_snapshot.take() {
            if snap.index > self.last_applied {
                self.last_applied = snap.index;
                return vec![ApplyMsg::SnapshotInstalled {
                    index: snap.index,
                    term: snap.term,
                    data: snap.data,
                }];
            }
        }

        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let to = self
            .commit_index
            .min(self.last_applied + MAX_APPLY_BATCH as u64);
        let batch: Vec<ApplyMsg> = self
            .log
            .entries_between(self.last_applied + 1, to)
            .into_iter()
            .map(|e| ApplyMsg::CommandApplied {
                index: e.index,
                term: e.term,
                command: e.command,
            })
            .collect();
        if let Some(last) = batch.last() {
            self.last_applied = last.index();
        }
        batch
    }
}
