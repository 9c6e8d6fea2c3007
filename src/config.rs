//! Configuration for RaftKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftKvError, Result};

/// Main configuration for a RaftKV node
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Consensus Timing
    // -------------------------------------------------------------------------
    /// Interval between leader AppendEntries rounds (heartbeats)
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout
    pub election_timeout_base: Duration,

    /// Width of the random window added on top of `election_timeout_base`
    pub election_timeout_jitter: Duration,

    /// How often the election timer checks its deadline
    pub election_tick: Duration,

    /// Upper bound for a single outbound RPC (connect + reply)
    pub rpc_timeout: Duration,

    /// Seed for the per-node election RNG. `None` seeds from entropy.
    pub rng_seed: Option<u64>,

    // -------------------------------------------------------------------------
    // Apply Pipeline
    // -------------------------------------------------------------------------
    /// Capacity of the bounded engine → service apply queue
    pub apply_channel_capacity: usize,

    // -------------------------------------------------------------------------
    // KV Service
    // -------------------------------------------------------------------------
    /// How long a client request waits for its operation to be applied
    pub request_timeout: Duration,

    /// Persisted raft state size (bytes) that triggers a snapshot.
    /// `None` disables compaction.
    pub max_raft_state: Option<usize>,

    /// Period of the compaction-threshold check
    pub snapshot_check_interval: Duration,

    // -------------------------------------------------------------------------
    // Storage / Network
    // -------------------------------------------------------------------------
    /// Root directory for persisted state
    ///   {data_dir}/
    ///     └── node-{id}/raft.state
    pub data_dir: PathBuf,

    /// TCP listen address
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_base: Duration::from_millis(300),
            election_timeout_jitter: Duration::from_millis(300),
            election_tick: Duration::from_millis(10),
            rpc_timeout: Duration::from_millis(500),
            rng_seed: None,
            apply_channel_capacity: 64,
            request_timeout: Duration::from_millis(1000),
            max_raft_state: None,
            snapshot_check_interval: Duration::from_millis(10),
            data_dir: PathBuf::from("./raftkv_data"),
            listen_addr: "127.0.0.1:7100".to_string(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(RaftKvError::Config(
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if self.election_timeout_base <= self.heartbeat_interval {
            return Err(RaftKvError::Config(format!(
                "election_timeout_base ({:?}) must exceed heartbeat_interval ({:?})",
                self.election_timeout_base, self.heartbeat_interval
            )));
        }
        if self.election_tick.is_zero() {
            return Err(RaftKvError::Config(
                "election_tick must be non-zero".to_string(),
            ));
        }
        if self.apply_channel_capacity == 0 {
            return Err(RaftKvError::Config(
                "apply_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_raft_state == Some(0) {
            return Err(RaftKvError::Config(
                "max_raft_state must be positive (use None to disable)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the election timeout window (base + random jitter)
    pub fn election_timeout(mut self, base: Duration, jitter: Duration) -> Self {
        self.config.election_timeout_base = base;
        self.config.election_timeout_jitter = jitter;
        self
    }

    /// Set the election timer polling period
    pub fn election_tick(mut self, tick: Duration) -> Self {
        self.config.election_tick = tick;
        self
    }

    /// Set the per-RPC timeout
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    /// Seed the election RNGs for reproducible runs
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    /// Set the apply queue capacity
    pub fn apply_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.apply_channel_capacity = capacity;
        self
    }

    /// Set the client request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the snapshot threshold in bytes (`None` disables snapshots)
    pub fn max_raft_state(mut self, bytes: Option<usize>) -> Self {
        self.config.max_raft_state = bytes;
        self
    }

    /// Set the compaction check period
    pub fn snapshot_check_interval(mut self, interval: Duration) -> Self {
        self.config.snapshot_check_interval = interval;
        self
    }

    /// Set the data directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_election_must_exceed_heartbeat() {
        let config = Config::builder()
            .heartbeat_interval(Duration::from_millis(200))
            .election_timeout(Duration::from_millis(100), Duration::from_millis(50))
            .build();
        assert!(matches!(config.validate(), Err(RaftKvError::Config(_))));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = Config::builder().max_raft_state(Some(0)).build();
        assert!(config.validate().is_err());
    }
}
