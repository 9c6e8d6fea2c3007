//! TCP clients
//!
//! One short-lived connection per call: connect, write one request frame,
//! read one response frame.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{KvError, RaftKvError, Result};
use crate::kv::{GetArgs, KvEndpoint, PutAppendArgs};
use crate::protocol::{self, Request, Response};
use crate::raft::{NodeId, RpcReply, RpcRequest};
use crate::transport::Transport;

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| RaftKvError::Network(format!("address {} did not resolve", addr)))
}

fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&resolve(addr)?, timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Response> {
    protocol::write_frame(stream, request)?;
    let frame = protocol::read_frame(stream)?;
    protocol::decode(&frame)
}

// =============================================================================
// Consensus RPC
// =============================================================================

/// [`Transport`] that reaches peers over TCP
pub struct TcpTransport {
    peers: Vec<String>,
    timeout: Duration,
}

impl TcpTransport {
    /// `peers[i]` is the address of node `i`
    pub fn new(peers: Vec<String>, timeout: Duration) -> Self {
        Self { peers, timeout }
    }
}

impl Transport for TcpTransport {
    fn call(&self, peer: NodeId, request: RpcRequest) -> Option<RpcReply> {
        let addr = self.peers.get(peer)?;
        let name = request.name();
        let outcome = connect(addr, self.timeout)
            .and_then(|mut stream| exchange(&mut stream, &Request::Raft(request)));
        match outcome {
            Ok(Response::Raft(reply)) => Some(reply),
            Ok(other) => {
                tracing::trace!(peer, rpc = name, response = ?other, "peer did not answer the rpc");
                None
            }
            Err(e) => {
                tracing::trace!(peer, rpc = name, error = %e, "rpc failed");
                None
            }
        }
    }
}

// =============================================================================
// KV Client Endpoint
// =============================================================================

/// [`KvEndpoint`] for a node reached over TCP
pub struct TcpKvEndpoint {
    addr: String,
    timeout: Duration,
}

impl TcpKvEndpoint {
    /// `timeout` should exceed the server's request timeout
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Unreachable nodes are `ServerDead`; anything after connecting is `Timeout`
    fn send(&self, request: Request) -> std::result::Result<Response, KvError> {
        let mut stream = connect(&self.addr, self.timeout).map_err(|e| {
            tracing::debug!(addr = %self.addr, error = %e, "connect failed");
            KvError::ServerDead
        })?;
        exchange(&mut stream, &request).map_err(|e| {
            tracing::debug!(addr = %self.addr, error = %e, "request failed");
            KvError::Timeout
        })
    }

    pub fn ping(&self) -> std::result::Result<(), KvError> {
        match self.send(Request::Ping)? {
            Response::Pong => Ok(()),
            _ => Err(KvError::Timeout),
        }
    }
}

impl KvEndpoint for TcpKvEndpoint {
    fn get(&self, args: &GetArgs) -> std::result::Result<Option<String>, KvError> {
        match self.send(Request::Get(args.clone()))? {
            Response::Get(result) => result,
            _ => Err(KvError::Timeout),
        }
    }

    fn put_append(&self, args: &PutAppendArgs) -> std::result::Result<(), KvError> {
        match self.send(Request::PutAppend(args.clone()))? {
            Response::PutAppend(result) => result,
            _ => Err(KvError::Timeout),
        }
    }
}
