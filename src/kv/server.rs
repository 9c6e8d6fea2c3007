//! KV server
//!
//! Turns client calls into log commands, applies committed commands to a
//! [`KvState`], and snapshots that state when the raft log grows too large.
//!
//! ## Request Flow
//! ```text
//! get / put_append ──▶ Raft::submit ──▶ ... commit ...
//!        │                                    │
//!        │ wait on `applied`                  ▼ ApplyMsg
//!        │                          ┌───────────────────┐
//!        └──────────────────────────│ apply loop        │
//!             notify_all            │ KvState::apply    │
//!                                   └───────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::client::KvEndpoint;
use super::op::{ClientId, GetArgs, Op, PutAppendArgs};
use super::store::KvState;
use crate::config::Config;
use crate::error::{KvError, RaftKvError, Result};
use crate::persist::Persister;
use crate::protocol;
use crate::raft::{apply_channel, ApplyMsg, NodeId, Raft};
use crate::transport::Transport;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// A replica of the KV service
#[derive(Clone)]
pub struct KvServer {
    inner: Arc<Inner>,
}

struct Inner {
    me: NodeId,
    raft: Raft,
    config: Config,
    state: Mutex<KvState>,

    /// Signalled after every applied message
    applied: Condvar,

    dead: AtomicBool,
}

impl KvServer {
    /// Start a replica and its raft node
    ///
    /// State is first rebuilt from the persisted snapshot, then the apply
    /// loop replays whatever the log delivers after it.
    pub fn start(
        me: NodeId,
        cluster_size: usize,
        config: &Config,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
    ) -> Result<Self> {
        let snapshot = persister.read_snapshot()?;
        let state = KvState::from_snapshot(&snapshot)
            .map_err(|e| RaftKvError::CorruptState(format!("kv snapshot: {}", e)))?;
        if state.applied_index() > 0 {
            tracing::info!(node = me, index = state.applied_index(), keys = state.len(), "restored kv snapshot");
        }

        let (apply_tx, apply_rx) = apply_channel(config);
        let raft = Raft::start(me, cluster_size, config, transport, persister, apply_tx)?;

        let inner = Arc::new(Inner {
            me,
            raft,
            config: config.clone(),
            state: Mutex::new(state),
            applied: Condvar::new(),
            dead: AtomicBool::new(false),
        });

        let applier = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("kv-{}-apply", me))
            .spawn(move || applier.run_apply_loop(apply_rx))?;

        if let Some(limit) = config.max_raft_state {
            let compactor = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("kv-{}-snapshot", me))
                .spawn(move || compactor.run_snapshot_check(limit))?;
        }

        Ok(Self { inner })
    }

    // =========================================================================
    // Client Operations
    // =========================================================================

    /// Linearizable read; `Ok(None)` if the key does not exist
    pub fn get(&self, args: &GetArgs) -> std::result::Result<Option<String>, KvError> {
        self.inner.propose(Op::from(args))?;
        let state = self.inner.wait_applied(args.client_id, args.sequence_num)?;
        Ok(state.get(&args.key).map(str::to_string))
    }

    /// Put or append; returns once the write is applied
    pub fn put_append(&self, args: &PutAppendArgs) -> std::result::Result<(), KvError> {
        self.inner.propose(Op::from(args))?;
        self.inner.wait_applied(args.client_id, args.sequence_num)?;
        Ok(())
    }

    // =========================================================================
    // Lifecycle / Accessors
    // =========================================================================

    /// Stop the replica and its raft node (idempotent)
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
        self.inner.raft.kill();
        let _state = self.inner.state.lock();
        self.inner.applied.notify_all();
    }

    pub fn killed(&self) -> bool {
        self.inner.killed()
    }

    pub fn me(&self) -> NodeId {
        self.inner.me
    }

    pub fn raft(&self) -> &Raft {
        &self.inner.raft
    }

    /// Copy of the current applied state
    pub fn state(&self) -> KvState {
        self.inner.state.lock().clone()
    }
}

impl KvEndpoint for KvServer {
    fn get(&self, args: &GetArgs) -> std::result::Result<Option<String>, KvError> {
        KvServer::get(self, args)
    }

    fn put_append(&self, args: &PutAppendArgs) -> std::result::Result<(), KvError> {
        KvServer::put_append(self, args)
    }
}

impl Inner {
    fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Hand `op` to raft, mapping its answer to client errors
    fn propose(&self, op: Op) -> std::result::Result<(), KvError> {
        if self.killed() {
            return Err(KvError::ServerDead);
        }
        let command = protocol::encode(&op).map_err(|e| {
            tracing::error!(node = self.me, error = %e, "failed to encode op");
            KvError::Timeout
        })?;
        match self.raft.submit(command) {
            Ok(proposal) if proposal.is_leader => {
                tracing::trace!(
                    node = self.me,
                    index = proposal.index,
                    client = op.client_id,
                    seq = op.sequence_num,
                    "proposed op"
                );
                Ok(())
            }
            Ok(_) => Err(KvError::WrongLeader),
            Err(RaftKvError::Killed) => Err(KvError::ServerDead),
            Err(e) => {
                tracing::warn!(node = self.me, error = %e, "submit failed");
                Err(KvError::Timeout)
            }
        }
    }

    /// Block until `client`'s op `sequence_num` is applied
    ///
    /// Returns the locked state so the caller reads exactly what was applied.
    fn wait_applied(
        &self,
        client: ClientId,
        sequence_num: u64,
    ) -> std::result::Result<MutexGuard<'_, KvState>, KvError> {
        let deadline = Instant::now() + self.config.request_timeout;
        let mut state = self.state.lock();
        loop {
            if state.is_applied(client, sequence_num) {
                return Ok(state);
            }
            if self.killed() {
                return Err(KvError::ServerDead);
            }
            if self.applied.wait_until(&mut state, deadline).timed_out() {
                if state.is_applied(client, sequence_num) {
                    return Ok(state);
                }
                tracing::debug!(node = self.me, client, seq = sequence_num, "request timed out");
                return Err(KvError::Timeout);
            }
        }
    }

    // =========================================================================
    // Apply Loop
    // =========================================================================

    fn run_apply_loop(self: Arc<Self>, apply_rx: Receiver<ApplyMsg>) {
        loop {
            match apply_rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(msg) => {
                    self.apply(msg);
                    if self.killed() {
                        // Stops raft too when the apply itself was fatal
                        self.raft.kill();
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.killed() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn apply(&self, msg: ApplyMsg) {
        let mut state = self.state.lock();
        if self.killed() {
            return;
        }
        match msg {
            ApplyMsg::CommandApplied { index, command, .. } => {
                if index <= state.applied_index() {
                    return;
                }
                match protocol::decode::<Op>(&command) {
                    Ok(op) => {
                        if !state.apply(index, &op) {
                            tracing::trace!(node = self.me, index, client = op.client_id, seq = op.sequence_num, "skipped duplicate op");
                        }
                    }
                    Err(e) => {
                        tracing::error!(node = self.me, index, error = %e, "undecodable command in log");
                        state.skip(index);
                    }
                }
            }
            ApplyMsg::SnapshotInstalled { index, data, .. } => {
                if index <= state.applied_index() {
                    return;
                }
                match KvState::from_snapshot(&data) {
                    Ok(restored) => {
                        tracing::info!(node = self.me, index, keys = restored.len(), "installed snapshot");
                        *state = restored;
                        state.skip(index);
                    }
                    Err(e) => {
                        // Raft already moved past this index; applying later
                        // entries on the old state would diverge
                        tracing::error!(node = self.me, index, error = %e, "undecodable snapshot, shutting down");
                        self.dead.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
        self.applied.notify_all();
    }

    // =========================================================================
    // Compaction Trigger
    // =========================================================================

    fn run_snapshot_check(self: Arc<Self>, limit: usize) {
        let mut last_snapshot = 0;
        while !self.killed() {
            thread::sleep(self.config.snapshot_check_interval);
            if self.raft.state_size() < limit {
                continue;
            }

            let (index, bytes) = {
                let state = self.state.lock();
                if state.applied_index() <= last_snapshot {
                    continue;
                }
                match state.to_snapshot() {
                    Ok(bytes) => (state.applied_index(), bytes),
                    Err(e) => {
                        tracing::error!(node = self.me, error = %e, "failed to encode snapshot");
                        continue;
                    }
                }
            };

            tracing::debug!(node = self.me, index, bytes = bytes.len(), size = self.raft.state_size(), "raft state over limit, snapshotting");
            match self.raft.snapshot(index, bytes) {
                Ok(()) => last_snapshot = index,
                Err(RaftKvError::Killed) => return,
                Err(e) => tracing::error!(node = self.me, index, error = %e, "snapshot failed"),
            }
        }
    }
}
