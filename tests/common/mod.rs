//! Shared test harness
//!
//! In-process clusters on a [`LocalNetwork`] with [`MemoryPersister`]s that
//! survive crashes. Every node's apply stream is checked for ordering and
//! agreement with the other nodes as it arrives.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use raftkv::error::KvError;
use raftkv::kv::{GetArgs, KvEndpoint, PutAppendArgs};
use raftkv::persist::{MemoryPersister, Persister};
use raftkv::raft::{apply_channel, ApplyMsg, Raft, Role};
use raftkv::transport::LocalNetwork;
use raftkv::{Clerk, Config, KvServer};

// =============================================================================
// Timing
// =============================================================================

pub fn test_config() -> Config {
    Config::builder()
        .heartbeat_interval(Duration::from_millis(50))
        .election_timeout(Duration::from_millis(150), Duration::from_millis(150))
        .request_timeout(Duration::from_millis(800))
        .build()
}

/// Long enough for any election to settle
pub const ELECTION_SETTLE: Duration = Duration::from_millis(1000);

pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// Poll `check` every 20 ms until it yields a value or `timeout` passes
pub fn wait_for<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep_ms(20);
    }
}

pub fn cmd(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

// =============================================================================
// Raft Cluster
// =============================================================================

/// What one node's applier has seen
#[derive(Debug, Default, Clone)]
struct Applied {
    log: BTreeMap<u64, Vec<u8>>,
    last: u64,
}

/// Bytes a test service snapshots: (index, applied commands)
type ServiceSnapshot = (u64, BTreeMap<u64, Vec<u8>>);

struct Shared {
    applied: Vec<Applied>,
    /// Bumped on every start so a dead node's applier cannot touch its successor
    generation: Vec<u64>,
    errors: Vec<String>,
}

pub struct RaftCluster {
    pub net: LocalNetwork,
    pub config: Config,
    n: usize,
    nodes: Vec<Option<Raft>>,
    persisters: Vec<Arc<MemoryPersister>>,
    shared: Arc<Mutex<Shared>>,
    snapshot_every: Option<u64>,
}

impl RaftCluster {
    pub fn new(n: usize) -> Self {
        Self::build(n, None)
    }

    /// Cluster whose service snapshots after every `every` applied entries
    pub fn with_snapshots(n: usize, every: u64) -> Self {
        Self::build(n, Some(every))
    }

    fn build(n: usize, snapshot_every: Option<u64>) -> Self {
        let mut cluster = Self {
            net: LocalNetwork::new(n),
            config: test_config(),
            n,
            nodes: (0..n).map(|_| None).collect(),
            persisters: (0..n).map(|_| Arc::new(MemoryPersister::new())).collect(),
            shared: Arc::new(Mutex::new(Shared {
                applied: vec![Applied::default(); n],
                generation: vec![0; n],
                errors: Vec::new(),
            })),
            snapshot_every,
        };
        for i in 0..n {
            cluster.start(i);
        }
        cluster
    }

    pub fn raft(&self, i: usize) -> &Raft {
        self.nodes[i].as_ref().expect("node is not running")
    }

    pub fn persister(&self, i: usize) -> &Arc<MemoryPersister> {
        &self.persisters[i]
    }

    /// Start node `i` from whatever its persister holds
    pub fn start(&mut self, i: usize) {
        let persister = Arc::clone(&self.persisters[i]);

        // The service rebuilds from its own snapshot
        let restored = {
            let snapshot = persister.read_snapshot().unwrap();
            if snapshot.is_empty() {
                Applied::default()
            } else {
                let (index, log): ServiceSnapshot = bincode::deserialize(&snapshot).unwrap();
                Applied { log, last: index }
            }
        };
        let generation = {
            let mut shared = self.shared.lock();
            shared.applied[i] = restored;
            shared.generation[i] += 1;
            shared.generation[i]
        };

        let (tx, rx) = apply_channel(&self.config);
        let raft = Raft::start(i, self.n, &self.config, self.net.transport(i), persister, tx).unwrap();
        self.net.register(i, Arc::new(raft.clone()));

        let shared = Arc::clone(&self.shared);
        let every = self.snapshot_every;
        let applier_raft = raft.clone();
        thread::spawn(move || run_applier(i, generation, applier_raft, rx, shared, every));

        self.nodes[i] = Some(raft);
    }

    /// Kill node `i`, keeping a copy of what it persisted
    pub fn crash(&mut self, i: usize) {
        self.net.unregister(i);
        if let Some(raft) = self.nodes[i].take() {
            raft.kill();
        }
        // The dead node may still finish a write; the restarted one must not see it
        let copy = Arc::new(self.persisters[i].copy());
        self.persisters[i] = copy;
    }

    pub fn restart(&mut self, i: usize) {
        self.crash(i);
        self.start(i);
    }

    pub fn disconnect(&self, i: usize) {
        self.net.disconnect(i);
    }

    pub fn connect(&self, i: usize) {
        self.net.connect(i);
    }

    fn live_connected(&self) -> Vec<usize> {
        (0..self.n)
            .filter(|&i| self.nodes[i].is_some() && self.net.is_connected(i))
            .collect()
    }

    /// Exactly one leader among connected nodes; returns its id
    pub fn check_one_leader(&self) -> usize {
        let found = wait_for(Duration::from_secs(5), || {
            let mut by_term: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
            for i in self.live_connected() {
                let status = self.raft(i).status();
                if status.role == Role::Leader {
                    by_term.entry(status.term).or_default().push(i);
                }
            }
            for (term, leaders) in &by_term {
                assert!(leaders.len() <= 1, "term {} has leaders {:?}", term, leaders);
            }
            by_term.values().last().map(|leaders| leaders[0])
        });
        found.expect("expected one leader, got none")
    }

    pub fn check_no_leader(&self) {
        for i in self.live_connected() {
            assert_ne!(self.raft(i).status().role, Role::Leader, "node {} unexpectedly leader", i);
        }
    }

    /// Term shared by all connected nodes
    pub fn check_terms(&self) -> u64 {
        let terms: Vec<u64> = self.live_connected().iter().map(|&i| self.raft(i).status().term).collect();
        let first = terms[0];
        assert!(terms.iter().all(|&t| t == first), "terms disagree: {:?}", terms);
        first
    }

    /// How many nodes have applied `index`, and the command there
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        let shared = self.shared.lock();
        assert!(shared.errors.is_empty(), "apply errors: {:?}", shared.errors);
        let mut count = 0;
        let mut command = None;
        for applied in &shared.applied {
            if let Some(c) = applied.log.get(&index) {
                if let Some(prev) = &command {
                    assert_eq!(prev, c, "nodes applied different commands at {}", index);
                }
                count += 1;
                command = Some(c.clone());
            } else if applied.last >= index {
                // Folded into a snapshot after being applied
                count += 1;
            }
        }
        (count, command)
    }

    /// Submit `command` until a leader commits it on `expected` nodes
    pub fn one(&self, command: Vec<u8>, expected: usize, retry: bool) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut start = 0;
        while Instant::now() < deadline {
            let mut index = None;
            for k in 0..self.n {
                let i = (start + k) % self.n;
                if let Some(raft) = &self.nodes[i] {
                    if !self.net.is_connected(i) {
                        continue;
                    }
                    if let Ok(proposal) = raft.submit(command.clone()) {
                        if proposal.is_leader {
                            index = Some(proposal.index);
                            start = i;
                            break;
                        }
                    }
                }
            }

            if let Some(index) = index {
                let committed = wait_for(Duration::from_secs(2), || {
                    let (count, got) = self.n_committed(index);
                    (count >= expected && got.as_deref() == Some(command.as_slice())).then_some(())
                });
                if committed.is_some() {
                    return index;
                }
                if !retry {
                    panic!("one({:?}) failed to reach agreement", command);
                }
            } else {
                sleep_ms(50);
            }
        }
        panic!("one({:?}) failed to reach agreement", command);
    }

    pub fn check_no_apply_errors(&self) {
        let shared = self.shared.lock();
        assert!(shared.errors.is_empty(), "apply errors: {:?}", shared.errors);
    }

    pub fn shutdown(&mut self) {
        for i in 0..self.n {
            if let Some(raft) = self.nodes[i].take() {
                raft.kill();
            }
        }
    }
}

impl Drop for RaftCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_applier(
    me: usize,
    generation: u64,
    raft: Raft,
    rx: Receiver<ApplyMsg>,
    shared: Arc<Mutex<Shared>>,
    snapshot_every: Option<u64>,
) {
    loop {
        let msg = match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) if raft.killed() => return,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let snapshot = {
            let mut guard = shared.lock();
            if guard.generation[me] != generation {
                return;
            }
            let Shared { applied, errors, .. } = &mut *guard;
            match msg {
                ApplyMsg::CommandApplied { index, command, .. } => {
                    if index != applied[me].last + 1 {
                        errors.push(format!("node {} applied {} after {}", me, index, applied[me].last));
                    }
                    for (other, view) in applied.iter().enumerate() {
                        if let Some(theirs) = view.log.get(&index) {
                            if *theirs != command {
                                errors.push(format!("node {} and {} disagree at {}", me, other, index));
                            }
                        }
                    }
                    applied[me].log.insert(index, command);
                    applied[me].last = index;
                    match snapshot_every {
                        Some(every) if index % every == 0 => {
                            let snap: ServiceSnapshot = (index, applied[me].log.clone());
                            Some((index, bincode::serialize(&snap).unwrap()))
                        }
                        _ => None,
                    }
                }
                ApplyMsg::SnapshotInstalled { index, data, .. } => {
                    if index <= applied[me].last {
                        errors.push(format!("node {} got stale snapshot {} at {}", me, index, applied[me].last));
                    }
                    let (snap_index, log): ServiceSnapshot = bincode::deserialize(&data).unwrap();
                    if snap_index != index {
                        errors.push(format!("snapshot index {} labelled {}", snap_index, index));
                    }
                    applied[me] = Applied { log, last: index };
                    None
                }
            }
        };

        if let Some((index, bytes)) = snapshot {
            let _ = raft.snapshot(index, bytes);
        }
    }
}

// =============================================================================
// KV Cluster
// =============================================================================

pub struct KvCluster {
    pub net: LocalNetwork,
    pub config: Config,
    n: usize,
    servers: Arc<Mutex<Vec<Option<KvServer>>>>,
    persisters: Vec<Arc<MemoryPersister>>,
}

impl KvCluster {
    pub fn new(n: usize, max_raft_state: Option<usize>) -> Self {
        let config = Config::builder()
            .heartbeat_interval(Duration::from_millis(50))
            .election_timeout(Duration::from_millis(150), Duration::from_millis(150))
            .request_timeout(Duration::from_millis(800))
            .max_raft_state(max_raft_state)
            .build();
        let mut cluster = Self {
            net: LocalNetwork::new(n),
            config,
            n,
            servers: Arc::new(Mutex::new((0..n).map(|_| None).collect())),
            persisters: (0..n).map(|_| Arc::new(MemoryPersister::new())).collect(),
        };
        for i in 0..n {
            cluster.start(i);
        }
        cluster
    }

    pub fn start(&mut self, i: usize) {
        let server = KvServer::start(
            i,
            self.n,
            &self.config,
            self.net.transport(i),
            Arc::clone(&self.persisters[i]) as Arc<dyn Persister>,
        )
        .unwrap();
        self.net.register(i, Arc::new(server.raft().clone()));
        self.servers.lock()[i] = Some(server);
    }

    pub fn crash(&mut self, i: usize) {
        self.net.unregister(i);
        if let Some(server) = self.servers.lock()[i].take() {
            server.kill();
        }
        let copy = Arc::new(self.persisters[i].copy());
        self.persisters[i] = copy;
    }

    pub fn server(&self, i: usize) -> Option<KvServer> {
        self.servers.lock()[i].clone()
    }

    pub fn persister(&self, i: usize) -> &Arc<MemoryPersister> {
        &self.persisters[i]
    }

    pub fn leader(&self) -> usize {
        wait_for(Duration::from_secs(5), || {
            (0..self.n).find(|&i| {
                self.net.is_connected(i)
                    && self.server(i).map(|s| s.raft().is_leader()).unwrap_or(false)
            })
        })
        .expect("no kv leader elected")
    }

    /// Clerk that can reach every server the network lets it reach
    pub fn clerk(&self) -> Clerk {
        let endpoints: Vec<Arc<dyn KvEndpoint>> = (0..self.n)
            .map(|i| {
                Arc::new(LocalKvEndpoint {
                    id: i,
                    net: self.net.clone(),
                    servers: Arc::clone(&self.servers),
                }) as Arc<dyn KvEndpoint>
            })
            .collect();
        Clerk::new(endpoints).with_deadline(Duration::from_secs(20))
    }

    pub fn shutdown(&mut self) {
        for slot in self.servers.lock().iter_mut() {
            if let Some(server) = slot.take() {
                server.kill();
            }
        }
    }
}

impl Drop for KvCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client link to one server, cut when the server is partitioned away
struct LocalKvEndpoint {
    id: usize,
    net: LocalNetwork,
    servers: Arc<Mutex<Vec<Option<KvServer>>>>,
}

impl LocalKvEndpoint {
    fn server(&self) -> Result<KvServer, KvError> {
        if !self.net.is_connected(self.id) {
            return Err(KvError::WrongLeader);
        }
        self.servers.lock()[self.id].clone().ok_or(KvError::ServerDead)
    }
}

impl KvEndpoint for LocalKvEndpoint {
    fn get(&self, args: &GetArgs) -> Result<Option<String>, KvError> {
        self.server()?.get(args)
    }

    fn put_append(&self, args: &PutAppendArgs) -> Result<(), KvError> {
        self.server()?.put_append(args)
    }
}
