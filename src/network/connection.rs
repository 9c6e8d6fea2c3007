//! Connection Handler
//!
//! Serves one TCP connection: reads [`Request`] frames and answers each
//! with a [`Response`] until the peer hangs up.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{RaftKvError, Result};
use crate::kv::KvServer;
use crate::protocol::{self, Request, Response};
use crate::transport::RpcHandler;

/// Handles a single peer or client connection
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    node: KvServer,
    peer_addr: String,
}

/// Read errors that just mean the other side is gone or idle
fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

impl Connection {
    pub fn new(stream: TcpStream, node: KvServer) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;

        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
            node,
            peer_addr,
        })
    }

    /// Bound how long a read or write may block
    pub fn set_timeouts(&mut self, read: Option<Duration>, write: Option<Duration>) -> Result<()> {
        self.reader.get_ref().set_read_timeout(read)?;
        self.writer.get_ref().set_write_timeout(write)?;
        Ok(())
    }

    /// Serve requests until the peer disconnects
    pub fn handle(&mut self) -> Result<()> {
        tracing::trace!(peer = %self.peer_addr, "connection established");

        loop {
            let request = match protocol::read_frame(&mut self.reader)
                .and_then(|frame| protocol::decode::<Request>(&frame))
            {
                Ok(request) => request,
                Err(RaftKvError::Io(ref e)) if is_disconnect(e.kind()) => {
                    tracing::trace!(peer = %self.peer_addr, reason = ?e.kind(), "connection closed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "bad request");
                    let _ = protocol::write_frame(&mut self.writer, &Response::Unavailable(e.to_string()));
                    return Err(e);
                }
            };

            tracing::trace!(peer = %self.peer_addr, request = request.name(), "received request");
            let response = self.dispatch(request);

            if let Err(e) = protocol::write_frame(&mut self.writer, &response) {
                if let RaftKvError::Io(ref io_err) = e {
                    if is_disconnect(io_err.kind()) {
                        tracing::debug!(peer = %self.peer_addr, "peer left before the response was sent");
                        return Ok(());
                    }
                }
                tracing::warn!(peer = %self.peer_addr, error = %e, "write failed");
                return Err(e);
            }
        }
    }

    fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Raft(rpc) => match self.node.raft().handle(rpc) {
                Ok(reply) => Response::Raft(reply),
                Err(e) => Response::Unavailable(e.to_string()),
            },
            Request::Get(args) => Response::Get(self.node.get(&args)),
            Request::PutAppend(args) => Response::PutAppend(self.node.put_append(&args)),
            Request::Ping => Response::Pong,
        }
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}
