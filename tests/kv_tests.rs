//! Tests for the replicated KV service
//!
//! These tests verify:
//! - Get/Put/Append semantics through the clerk
//! - At-most-once application of retried operations
//! - WrongLeader / Timeout / ServerDead reporting
//! - A timed-out operation resent verbatim takes effect once
//! - Progress across leader failure and an unreliable network
//! - Snapshot-triggered compaction, restart from snapshot, and snapshot
//!   transfer to a lagging replica

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use raftkv::error::{KvError, RaftKvError};
use raftkv::kv::{GetArgs, PutAppendArgs, PutMode};
use raftkv::persist::{MemoryPersister, Persister};
use raftkv::raft::{InstallSnapshotArgs, RpcRequest};
use raftkv::transport::{LocalNetwork, RpcHandler};
use raftkv::{Config, KvServer};

use common::{sleep_ms, wait_for, KvCluster, ELECTION_SETTLE};

// =============================================================================
// Helper Functions
// =============================================================================

fn append_args(key: &str, value: &str, client_id: u64, sequence_num: u64) -> PutAppendArgs {
    PutAppendArgs {
        key: key.to_string(),
        value: value.to_string(),
        mode: PutMode::Append,
        client_id,
        sequence_num,
    }
}

fn get_args(key: &str, client_id: u64, sequence_num: u64) -> GetArgs {
    GetArgs {
        key: key.to_string(),
        client_id,
        sequence_num,
    }
}

// =============================================================================
// Basic Semantics
// =============================================================================

#[test]
fn test_put_get_append() {
    let cluster = KvCluster::new(3, None);
    let mut clerk = cluster.clerk();

    clerk.put("k", "v1").unwrap();
    assert_eq!(clerk.get("k").unwrap(), Some("v1".to_string()));

    clerk.put("k", "v2").unwrap();
    assert_eq!(clerk.get("k").unwrap(), Some("v2".to_string()));

    clerk.append("a", "b").unwrap();
    clerk.append("a", "c").unwrap();
    assert_eq!(clerk.get("a").unwrap(), Some("bc".to_string()));
}

#[test]
fn test_get_missing_key() {
    let cluster = KvCluster::new(3, None);
    let mut clerk = cluster.clerk();
    assert_eq!(clerk.get("nothing-here").unwrap(), None);
}

#[test]
fn test_retried_operation_applied_once() {
    let cluster = KvCluster::new(3, None);
    let leader = cluster.server(cluster.leader()).unwrap();

    // The same (client, seq) sent twice, as after a lost reply
    let args = append_args("x", "1", 7, 1);
    leader.put_append(&args).unwrap();
    leader.put_append(&args).unwrap();

    let value = leader.get(&get_args("x", 8, 1)).unwrap();
    assert_eq!(value, Some("1".to_string()));
    assert_eq!(leader.state().last_sequence(7), 1);
}

#[test]
fn test_all_replicas_converge() {
    let cluster = KvCluster::new(3, None);
    let mut clerk = cluster.clerk();
    for i in 0..10 {
        clerk.append("log", &i.to_string()).unwrap();
    }
    let expected = "0123456789".to_string();

    let converged = wait_for(Duration::from_secs(3), || {
        (0..3)
            .all(|i| cluster.server(i).unwrap().state().get("log") == Some(expected.as_str()))
            .then_some(())
    });
    assert!(converged.is_some(), "replicas did not converge");
}

#[test]
fn test_timed_out_operation_retried_identically() {
    let cluster = KvCluster::new(3, None);
    let leader = cluster.leader();
    cluster.net.disconnect((leader + 1) % 3);
    cluster.net.disconnect((leader + 2) % 3);

    // The entry may still be in the old leader's log when it times out
    let args = append_args("x", "1", 7, 1);
    let server = cluster.server(leader).unwrap();
    assert_eq!(server.put_append(&args), Err(KvError::Timeout));

    for i in 0..3 {
        cluster.net.connect(i);
    }
    let accepted = wait_for(Duration::from_secs(10), || {
        (0..3).find(|&i| cluster.server(i).unwrap().put_append(&args).is_ok())
    });
    assert!(accepted.is_some(), "retry never accepted");

    let converged = wait_for(Duration::from_secs(3), || {
        (0..3)
            .all(|i| cluster.server(i).unwrap().state().get("x") == Some("1"))
            .then_some(())
    });
    let values: Vec<Option<String>> = (0..3)
        .map(|i| cluster.server(i).unwrap().state().get("x").map(str::to_string))
        .collect();
    assert!(converged.is_some(), "replicas hold {:?}", values);
}

// =============================================================================
// Error Reporting
// =============================================================================

#[test]
fn test_follower_reports_wrong_leader() {
    let cluster = KvCluster::new(3, None);
    let leader = cluster.leader();
    let follower = cluster.server((leader + 1) % 3).unwrap();

    assert_eq!(follower.get(&get_args("k", 1, 1)), Err(KvError::WrongLeader));
    assert_eq!(follower.put_append(&append_args("k", "v", 1, 1)), Err(KvError::WrongLeader));
}

#[test]
fn test_leader_without_majority_times_out() {
    let cluster = KvCluster::new(3, None);
    let leader = cluster.leader();
    cluster.net.disconnect((leader + 1) % 3);
    cluster.net.disconnect((leader + 2) % 3);

    let server = cluster.server(leader).unwrap();
    let started = Instant::now();
    let result = server.put_append(&append_args("k", "v", 3, 1));
    assert_eq!(result, Err(KvError::Timeout));
    assert!(started.elapsed() >= cluster.config.request_timeout);
}

#[test]
fn test_killed_server_reports_dead() {
    let cluster = KvCluster::new(3, None);
    let server = cluster.server(0).unwrap();
    server.kill();
    server.kill();
    assert!(server.killed());
    assert_eq!(server.get(&get_args("k", 1, 1)), Err(KvError::ServerDead));
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_progress_after_leader_partition() {
    let cluster = KvCluster::new(5, None);
    let mut clerk = cluster.clerk();
    clerk.put("k", "a").unwrap();

    let leader = cluster.leader();
    cluster.net.disconnect(leader);
    clerk.append("k", "b").unwrap();
    assert_eq!(clerk.get("k").unwrap(), Some("ab".to_string()));

    cluster.net.connect(leader);
    thread::sleep(ELECTION_SETTLE);
    clerk.append("k", "c").unwrap();
    assert_eq!(clerk.get("k").unwrap(), Some("abc".to_string()));
}

#[test]
fn test_concurrent_clerks_unreliable_network() {
    let cluster = KvCluster::new(5, None);
    cluster.net.set_reliable(false);

    thread::scope(|scope| {
        for c in 0..3 {
            let mut clerk = cluster.clerk();
            scope.spawn(move || {
                let key = format!("client{}", c);
                for i in 0..8 {
                    clerk.append(&key, &format!("x{}.{} ", c, i)).unwrap();
                }
            });
        }
    });

    cluster.net.set_reliable(true);
    let mut clerk = cluster.clerk();
    for c in 0..3 {
        let expected: String = (0..8).map(|i| format!("x{}.{} ", c, i)).collect();
        assert_eq!(clerk.get(&format!("client{}", c)).unwrap(), Some(expected));
    }
}

// =============================================================================
// Snapshots
// =============================================================================

#[test]
fn test_compaction_and_restart_from_snapshot() {
    let mut cluster = KvCluster::new(3, Some(2000));
    let mut clerk = cluster.clerk();
    for i in 0..50 {
        clerk.put(&format!("key{}", i), &format!("value{}", i)).unwrap();
    }

    let compacted = wait_for(Duration::from_secs(3), || {
        (0..3)
            .all(|i| cluster.server(i).unwrap().raft().status().last_included_index > 0)
            .then_some(())
    });
    assert!(compacted.is_some(), "no replica compacted its log");
    for i in 0..3 {
        assert!(cluster.persister(i).snapshot_size() > 0);
    }

    for i in 0..3 {
        cluster.crash(i);
    }
    for i in 0..3 {
        cluster.start(i);
        let server = cluster.server(i).unwrap();
        assert!(server.raft().status().last_included_index > 0);
        // Early keys only exist in the snapshot now
        assert_eq!(server.state().get("key0"), Some("value0"));
    }

    let mut clerk = cluster.clerk();
    for i in 0..50 {
        assert_eq!(clerk.get(&format!("key{}", i)).unwrap(), Some(format!("value{}", i)));
    }
}

#[test]
fn test_raft_state_stays_bounded() {
    let limit = 2000;
    let cluster = KvCluster::new(3, Some(limit));
    let mut clerk = cluster.clerk();
    for i in 0..100 {
        clerk.append("k", &i.to_string()).unwrap();
    }
    sleep_ms(200);
    for i in 0..3 {
        let size = cluster.persister(i).state_size();
        assert!(size < limit * 2, "replica {} raft state grew to {} bytes", i, size);
    }
}

#[test]
fn test_lagging_replica_catches_up_by_snapshot() {
    let cluster = KvCluster::new(3, Some(1000));
    let mut clerk = cluster.clerk();
    clerk.put("first", "1").unwrap();

    let leader = cluster.leader();
    let lagging = (leader + 1) % 3;
    cluster.net.disconnect(lagging);

    for i in 0..60 {
        clerk.put(&format!("k{}", i), &i.to_string()).unwrap();
    }

    cluster.net.connect(lagging);
    clerk.put("last", "done").unwrap();

    let server = cluster.server(lagging).unwrap();
    let caught_up = wait_for(Duration::from_secs(5), || {
        (server.state().get("last") == Some("done")).then_some(())
    });
    assert!(caught_up.is_some(), "lagging replica never caught up");
    assert_eq!(server.state().get("k0"), Some("0"));
    assert_eq!(server.state().get("k59"), Some("59"));
    assert!(server.raft().status().last_included_index > 1);
}

#[test]
fn test_undecodable_snapshot_stops_server() {
    let config = Config::builder()
        .heartbeat_interval(Duration::from_millis(50))
        .election_timeout(Duration::from_secs(10), Duration::from_secs(1))
        .build();
    let net = LocalNetwork::new(3);
    let persister = Arc::new(MemoryPersister::new());
    let server = KvServer::start(0, 3, &config, net.transport(0), persister.clone()).unwrap();

    let install = RpcRequest::InstallSnapshot(InstallSnapshotArgs {
        term: 1,
        leader_id: 1,
        last_included_index: 5,
        last_included_term: 1,
        data: b"not a kv snapshot".to_vec(),
    });
    server.raft().handle(install).unwrap();

    let stopped = wait_for(Duration::from_secs(2), || {
        (server.killed() && server.raft().killed()).then_some(())
    });
    assert!(stopped.is_some(), "server kept running on stale state");
    assert_eq!(server.state().applied_index(), 0);
    assert_eq!(server.get(&get_args("k", 1, 1)), Err(KvError::ServerDead));

    // The bad snapshot is durable, so a restart refuses it too
    let restarted = KvServer::start(0, 3, &config, net.transport(0), persister);
    assert!(matches!(restarted, Err(RaftKvError::CorruptState(_))));
}
