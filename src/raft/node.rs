//! Raft node runtime
//!
//! Owns the threads that drive a [`RaftState`]: the election timer, one
//! replicator per peer, short-lived vote requesters, and the applier that
//! feeds the service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::message::{ApplyMsg, RequestVoteArgs, RpcReply, RpcRequest};
use super::state::{PersistNeed, PersistentState, RaftState, Role, Status};
use super::timer::ElectionTimer;
use super::NodeId;
use crate::config::Config;
use crate::error::{RaftKvError, Result};
use crate::persist::Persister;
use crate::protocol;
use crate::transport::{RpcHandler, Transport};

/// How often blocked workers re-check the dead flag
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Result of [`Raft::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Index the command will occupy if it commits
    pub index: u64,
    /// Term in which it was appended
    pub term: u64,
    /// `false` means nothing was appended; retry on another node
    pub is_leader: bool,
}

/// Create the bounded engine → service apply queue
pub fn apply_channel(config: &Config) -> (Sender<ApplyMsg>, Receiver<ApplyMsg>) {
    channel::bounded(config.apply_channel_capacity)
}

/// Handle to a running Raft node
///
/// Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

struct Inner {
    me: NodeId,
    cluster_size: usize,
    config: Config,

    /// The single critical section shared by every activity
    state: Mutex<RaftState>,

    /// Signalled when there is something to apply
    apply_cond: Condvar,

    /// Signalled when replicators should send right away
    replicate_cond: Condvar,

    dead: AtomicBool,
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
}

impl Raft {
    /// Start a node
    ///
    /// Recovers term, vote, log and snapshot point from `persister`; a
    /// persisted state that fails to decode is fatal and the node refuses
    /// to start.
    pub fn start(
        me: NodeId,
        cluster_size: usize,
        config: &Config,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg>,
    ) -> Result<Self> {
        config.validate()?;
        if me >= cluster_size {
            return Err(RaftKvError::Config(format!(
                "node id {} outside cluster of {}",
                me, cluster_size
            )));
        }

        let timer = ElectionTimer::new(
            me,
            config.election_timeout_base,
            config.election_timeout_jitter,
            config.rng_seed,
        );
        let mut state = RaftState::new(me, cluster_size, timer, Instant::now());

        let raw = persister.read_state()?;
        if !raw.is_empty() {
            let persisted: PersistentState = protocol::decode(&raw)
                .map_err(|e| RaftKvError::CorruptState(format!("raft state: {}", e)))?;
            let snapshot = persister.read_snapshot()?;
            state.restore(persisted, snapshot);
            let status = state.status();
            tracing::info!(
                node = me,
                term = status.term,
                last_index = status.last_log_index,
                snapshot_index = status.last_included_index,
                "recovered persisted state"
            );
        }

        let inner = Arc::new(Inner {
            me,
            cluster_size,
            config: config.clone(),
            state: Mutex::new(state),
            apply_cond: Condvar::new(),
            replicate_cond: Condvar::new(),
            dead: AtomicBool::new(false),
            transport,
            persister,
        });

        let election = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("raft-{}-election", me))
            .spawn(move || election.run_election_timer())?;

        let applier = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("raft-{}-applier", me))
            .spawn(move || applier.run_applier(apply_tx))?;

        for peer in (0..cluster_size).filter(|&p| p != me) {
            let replicator = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("raft-{}-replicate-{}", me, peer))
                .spawn(move || replicator.run_replicator(peer))?;
        }

        Ok(Self { inner })
    }

    // =========================================================================
    // Service Interface
    // =========================================================================

    /// Append `command` to the log if this node is leader
    ///
    /// Returns as soon as the entry is durable locally; commitment is
    /// reported later through the apply channel.
    pub fn submit(&self, command: Vec<u8>) -> Result<Proposal> {
        let mut state = self.inner.state.lock();
        if self.inner.killed() {
            return Err(RaftKvError::Killed);
        }

        let (index, term) = match state.submit(command) {
            Some(appended) => appended,
            None => {
                return Ok(Proposal {
                    index: 0,
                    term: state.current_term(),
                    is_leader: false,
                })
            }
        };

        if let Err(err) = self.inner.persist(&mut state) {
            state.retract(index);
            return Err(err);
        }
        state.commit_local();

        tracing::trace!(node = self.inner.me, index, term, "submitted command");
        self.inner.replicate_cond.notify_all();
        self.inner.signal_apply(&state);
        Ok(Proposal {
            index,
            term,
            is_leader: true,
        })
    }

    /// Discard log entries through `index`, replacing them with `data`
    ///
    /// Log and snapshot are persisted together. Stale or not-yet-applied
    /// indices are ignored.
    pub fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if self.inner.killed() {
            return Err(RaftKvError::Killed);
        }
        if state.compact(index, data) {
            self.inner.persist(&mut state)?;
        }
        Ok(())
    }

    /// Stop all activity (idempotent)
    ///
    /// In-flight RPCs are not aborted; their results are discarded.
    pub fn kill(&self) {
        if !self.inner.dead.swap(true, Ordering::SeqCst) {
            tracing::info!(node = self.inner.me, "raft node killed");
        }
        let _state = self.inner.state.lock();
        self.inner.apply_cond.notify_all();
        self.inner.replicate_cond.notify_all();
    }

    pub fn killed(&self) -> bool {
        self.inner.killed()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn me(&self) -> NodeId {
        self.inner.me
    }

    pub fn cluster_size(&self) -> usize {
        self.inner.cluster_size
    }

    pub fn status(&self) -> Status {
        self.inner.state.lock().status()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.lock().role() == Role::Leader
    }

    /// Size in bytes of the persisted raft state (excluding the snapshot)
    pub fn state_size(&self) -> usize {
        self.inner.persister.state_size()
    }
}

impl RpcHandler for Raft {
    fn handle(&self, request: RpcRequest) -> Result<RpcReply> {
        let mut state = self.inner.state.lock();
        if self.inner.killed() {
            return Err(RaftKvError::Killed);
        }

        let now = Instant::now();
        tracing::trace!(node = self.inner.me, rpc = request.name(), term = request.term(), "handling rpc");
        let reply = match &request {
            RpcRequest::RequestVote(args) => {
                RpcReply::RequestVote(state.handle_request_vote(args, now))
            }
            RpcRequest::AppendEntries(args) => {
                RpcReply::AppendEntries(state.handle_append_entries(args, now))
            }
            RpcRequest::InstallSnapshot(args) => {
                RpcReply::InstallSnapshot(state.handle_install_snapshot(args, now))
            }
        };

        // Nothing leaves this node until it is on stable storage
        self.inner.persist(&mut state)?;
        self.inner.signal_apply(&state);
        Ok(reply)
    }
}

impl Inner {
    fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Write whatever the last state change marked dirty
    fn persist(&self, state: &mut RaftState) -> Result<()> {
        let need = state.take_persist_need();
        let result = match need {
            PersistNeed::Clean => return Ok(()),
            PersistNeed::State => protocol::encode(&state.persistent_state())
                .and_then(|bytes| self.persister.save_state(&bytes)),
            PersistNeed::StateAndSnapshot => protocol::encode(&state.persistent_state())
                .and_then(|bytes| self.persister.save_state_and_snapshot(&bytes, state.snapshot())),
        };
        if let Err(err) = &result {
            tracing::error!(node = self.me, error = %err, "failed to persist raft state");
            state.restore_persist_need(need);
        }
        result
    }

    fn signal_apply(&self, state: &RaftState) {
        if state.has_apply_work() {
            self.apply_cond.notify_one();
        }
    }

    // =========================================================================
    // Election
    // =========================================================================

    fn run_election_timer(self: Arc<Self>) {
        while !self.killed() {
            thread::sleep(self.config.election_tick);

            let args = {
                let mut state = self.state.lock();
                if self.killed() {
                    return;
                }
                let now = Instant::now();
                if state.role() == Role::Leader || now < state.election_deadline() {
                    continue;
                }
                let args = state.start_election(now);
                if self.persist(&mut state).is_err() {
                    // Retry on the next deadline rather than campaign on an
                    // unrecorded vote
                    continue;
                }
                if state.role() == Role::Leader {
                    self.replicate_cond.notify_all();
                }
                args
            };

            self.request_votes(args);
        }
    }

    /// Ask every peer for its vote in parallel
    fn request_votes(self: &Arc<Self>, args: RequestVoteArgs) {
        for peer in (0..self.cluster_size).filter(|&p| p != self.me) {
            let inner = Arc::clone(self);
            let args = args.clone();
            let spawned = thread::Builder::new()
                .name(format!("raft-{}-vote-{}", self.me, peer))
                .spawn(move || inner.request_vote(peer, args));
            if let Err(err) = spawned {
                tracing::warn!(node = self.me, peer, error = %err, "could not spawn vote request");
            }
        }
    }

    fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) {
        let term = args.term;
        let reply = match self.transport.call(peer, RpcRequest::RequestVote(args)) {
            Some(RpcReply::RequestVote(reply)) => reply,
            Some(other) => {
                tracing::warn!(node = self.me, peer, ?other, "mismatched reply to RequestVote");
                return;
            }
            None => return,
        };

        let mut state = self.state.lock();
        if self.killed() {
            return;
        }
        let won = state.handle_vote_reply(peer, term, &reply, Instant::now());
        let _ = self.persist(&mut state);
        if won {
            // Heartbeats go out immediately to assert leadership
            self.replicate_cond.notify_all();
        }
    }

    // =========================================================================
    // Replication
    // =========================================================================

    fn run_replicator(self: Arc<Self>, peer: NodeId) {
        let heartbeat = self.config.heartbeat_interval;
        let mut state = self.state.lock();
        loop {
            if self.killed() {
                return;
            }
            if state.role() != Role::Leader {
                self.replicate_cond.wait_for(&mut state, heartbeat);
                continue;
            }
            let request = match state.replication_request(peer) {
                Some(request) => request,
                None => continue,
            };

            let sent = request.clone();
            let reply = MutexGuard::unlocked(&mut state, || self.transport.call(peer, request));
            if self.killed() {
                return;
            }

            let now = Instant::now();
            let delivered = reply.is_some();
            match (sent, reply) {
                (RpcRequest::AppendEntries(args), Some(RpcReply::AppendEntries(reply))) => {
                    state.handle_append_reply(peer, &args, &reply, now);
                }
                (RpcRequest::InstallSnapshot(args), Some(RpcReply::InstallSnapshot(reply))) => {
                    tracing::debug!(node = self.me, peer, index = args.last_included_index, "snapshot delivered");
                    state.handle_snapshot_reply(peer, &args, &reply, now);
                }
                (_, None) => {}
                (sent, Some(other)) => {
                    tracing::warn!(node = self.me, peer, rpc = sent.name(), ?other, "mismatched reply");
                }
            }
            let _ = self.persist(&mut state);
            self.signal_apply(&state);

            // Keep streaming while the peer is behind; otherwise idle until
            // the next heartbeat or a new submission
            if !(delivered && state.peer_lagging(peer)) {
                self.replicate_cond.wait_for(&mut state, heartbeat);
            }
        }
    }

    // =========================================================================
    // Apply Pipeline
    // =========================================================================

    fn run_applier(self: Arc<Self>, apply_tx: Sender<ApplyMsg>) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                loop {
                    if self.killed() {
                        return;
                    }
                    if state.has_apply_work() {
                        break state.take_apply_batch();
                    }
                    self.apply_cond.wait_for(&mut state, SHUTDOWN_POLL);
                }
            };

            for msg in batch {
                if !self.deliver(&apply_tx, msg) {
                    return;
                }
            }
        }
    }

    /// Blocking send that gives up on shutdown or a dropped receiver
    fn deliver(&self, apply_tx: &Sender<ApplyMsg>, mut msg: ApplyMsg) -> bool {
        loop {
            if self.killed() {
                return false;
            }
            match apply_tx.send_timeout(msg, SHUTDOWN_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => msg = returned,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}
