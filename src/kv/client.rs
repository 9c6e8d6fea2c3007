//! KV client library
//!
//! A [`Clerk`] hides leader discovery and retries. Every operation gets a
//! fresh sequence number that is reused verbatim on each retry, so the
//! servers apply it at most once however many times it is sent.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::op::{ClientId, GetArgs, PutAppendArgs, PutMode};
use crate::error::KvError;

/// Default overall deadline for one clerk operation
pub const DEFAULT_OPERATION_DEADLINE: Duration = Duration::from_secs(10);

/// Pause between attempts after an error
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Something a clerk can send KV requests to
pub trait KvEndpoint: Send + Sync {
    fn get(&self, args: &GetArgs) -> Result<Option<String>, KvError>;

    fn put_append(&self, args: &PutAppendArgs) -> Result<(), KvError>;
}

/// Client handle for the replicated KV service
pub struct Clerk {
    servers: Vec<Arc<dyn KvEndpoint>>,
    client_id: ClientId,
    next_sequence: u64,
    leader: usize,
    deadline: Duration,
}

impl Clerk {
    /// Clerk with a random client id talking to `servers`
    pub fn new(servers: Vec<Arc<dyn KvEndpoint>>) -> Self {
        Self::with_client_id(servers, rand::random())
    }

    pub fn with_client_id(servers: Vec<Arc<dyn KvEndpoint>>, client_id: ClientId) -> Self {
        Self {
            servers,
            client_id,
            next_sequence: 0,
            leader: 0,
            deadline: DEFAULT_OPERATION_DEADLINE,
        }
    }

    /// Give up on an operation after `deadline`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Server the clerk currently believes is leader
    pub fn leader_hint(&self) -> usize {
        self.leader
    }

    /// Fetch `key`; `Ok(None)` if it does not exist
    pub fn get(&mut self, key: &str) -> Result<Option<String>, KvError> {
        let args = GetArgs {
            key: key.to_string(),
            client_id: self.client_id,
            sequence_num: self.next_sequence(),
        };
        self.retry(|server| server.get(&args))
    }

    pub fn put(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        self.put_append(key, value, PutMode::Put)
    }

    pub fn append(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        self.put_append(key, value, PutMode::Append)
    }

    fn put_append(&mut self, key: &str, value: &str, mode: PutMode) -> Result<(), KvError> {
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            mode,
            client_id: self.client_id,
            sequence_num: self.next_sequence(),
        };
        self.retry(|server| server.put_append(&args))
    }

    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Send until some server accepts, rotating on errors
    ///
    /// A timeout earns the same server one more try, since it may still be
    /// leader; anything else moves on to the next server.
    fn retry<T>(&mut self, mut send: impl FnMut(&dyn KvEndpoint) -> Result<T, KvError>) -> Result<T, KvError> {
        if self.servers.is_empty() {
            return Err(KvError::ServerDead);
        }
        let started = Instant::now();
        let mut retried_here = false;
        loop {
            match send(self.servers[self.leader].as_ref()) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.retry_same_node() && !retried_here {
                        retried_here = true;
                    } else {
                        retried_here = false;
                        self.leader = (self.leader + 1) % self.servers.len();
                    }
                    tracing::trace!(client = self.client_id, error = %err, next = self.leader, "retrying");
                }
            }
            if started.elapsed() >= self.deadline {
                return Err(KvError::Timeout);
            }
            thread::sleep(RETRY_BACKOFF);
        }
    }
}
