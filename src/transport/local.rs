//! In-process network
//!
//! Routes calls directly to registered handlers while still passing every
//! request and reply through the wire codec. Nodes can be cut off and
//! reconnected, and delivery can be made unreliable (random delay, dropped
//! requests and replies).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{RpcHandler, Transport};
use crate::protocol::{self, WireMessage};
use crate::raft::{NodeId, RpcReply, RpcRequest};

/// Upper bound of the random delay added in unreliable mode
const MAX_UNRELIABLE_DELAY_MS: u64 = 27;

/// Percentage of requests (and, separately, replies) lost in unreliable mode
const DROP_PERCENT: u32 = 10;

struct Endpoint {
    handler: Option<Arc<dyn RpcHandler>>,
    connected: bool,
}

struct NetState {
    endpoints: Vec<Endpoint>,
    reliable: bool,
}

struct NetInner {
    state: Mutex<NetState>,
    rng: Mutex<SmallRng>,
    rpc_count: AtomicU64,
}

/// Simulated network connecting a fixed set of nodes
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetInner>,
}

impl LocalNetwork {
    /// Network of `size` endpoints, all connected, no handlers registered
    pub fn new(size: usize) -> Self {
        let endpoints = (0..size)
            .map(|_| Endpoint {
                handler: None,
                connected: true,
            })
            .collect();
        Self {
            inner: Arc::new(NetInner {
                state: Mutex::new(NetState {
                    endpoints,
                    reliable: true,
                }),
                rng: Mutex::new(SmallRng::from_entropy()),
                rpc_count: AtomicU64::new(0),
            }),
        }
    }

    /// Route calls addressed to `id` to `handler`
    pub fn register(&self, id: NodeId, handler: Arc<dyn RpcHandler>) {
        self.inner.state.lock().endpoints[id].handler = Some(handler);
    }

    /// Remove the handler for `id`; calls to it fail until re-registered
    pub fn unregister(&self, id: NodeId) {
        self.inner.state.lock().endpoints[id].handler = None;
    }

    /// Restore traffic to and from `id`
    pub fn connect(&self, id: NodeId) {
        tracing::debug!(node = id, "connect");
        self.inner.state.lock().endpoints[id].connected = true;
    }

    /// Drop all traffic to and from `id`
    pub fn disconnect(&self, id: NodeId) {
        tracing::debug!(node = id, "disconnect");
        self.inner.state.lock().endpoints[id].connected = false;
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.inner.state.lock().endpoints[id].connected
    }

    /// Toggle random delays and message loss
    pub fn set_reliable(&self, reliable: bool) {
        self.inner.state.lock().reliable = reliable;
    }

    /// Total calls attempted so far
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::Relaxed)
    }

    /// Outbound transport for node `from`
    pub fn transport(&self, from: NodeId) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            net: self.clone(),
            from,
        })
    }

    fn link_up(&self, from: NodeId, to: NodeId) -> bool {
        let state = self.inner.state.lock();
        match (state.endpoints.get(from), state.endpoints.get(to)) {
            (Some(a), Some(b)) => a.connected && b.connected,
            _ => false,
        }
    }

    fn lossy(&self) -> bool {
        !self.inner.state.lock().reliable
    }

    fn roll_drop(&self) -> bool {
        self.inner.rng.lock().gen_range(0..100) < DROP_PERCENT
    }

    fn random_delay(&self) {
        let ms = self.inner.rng.lock().gen_range(0..MAX_UNRELIABLE_DELAY_MS);
        thread::sleep(Duration::from_millis(ms));
    }

    fn deliver(&self, from: NodeId, to: NodeId, request: RpcRequest) -> Option<RpcReply> {
        self.inner.rpc_count.fetch_add(1, Ordering::Relaxed);

        if !self.link_up(from, to) {
            return None;
        }
        if self.lossy() {
            self.random_delay();
            if self.roll_drop() {
                return None;
            }
        }

        let request = round_trip(&request)?;
        let handler = self.inner.state.lock().endpoints[to].handler.clone()?;
        let reply = match handler.handle(request) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::trace!(from, to, error = %err, "handler refused request");
                return None;
            }
        };

        // A partition that formed while the handler ran swallows the reply
        if !self.link_up(from, to) {
            return None;
        }
        if self.lossy() && self.roll_drop() {
            return None;
        }
        round_trip(&reply)
    }
}

/// Serialize and deserialize, so only what survives the wire is delivered
fn round_trip<T: WireMessage>(message: &T) -> Option<T> {
    let decoded = protocol::encode(message).and_then(|frame| protocol::decode(&frame));
    match decoded {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(error = %err, "message failed codec round trip");
            None
        }
    }
}

/// A node's view of a [`LocalNetwork`]
pub struct LocalTransport {
    net: LocalNetwork,
    from: NodeId,
}

impl Transport for LocalTransport {
    fn call(&self, peer: NodeId, request: RpcRequest) -> Option<RpcReply> {
        self.net.deliver(self.from, peer, request)
    }
}
