//! TCP Server
//!
//! Accepts connections on a background thread and serves each one on its
//! own thread.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::Connection;
use crate::config::Config;
use crate::error::Result;
use crate::kv::KvServer;

/// Sleep between accept attempts while idle
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Idle connections are closed after this long without a request
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// TCP front end of one node
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `config.listen_addr` and start accepting
    pub fn start(config: &Config, node: KvServer) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(node = node.me(), addr = %local_addr, "listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let write_timeout = config.rpc_timeout;
        let acceptor = thread::Builder::new()
            .name(format!("tcp-{}-accept", node.me()))
            .spawn(move || accept_loop(listener, node, flag, write_timeout))?;

        Ok(Self {
            local_addr,
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; open connections finish on their own
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }

    /// Block until the acceptor exits
    pub fn wait(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, node: KvServer, shutdown: Arc<AtomicBool>, write_timeout: Duration) {
    while !shutdown.load(Ordering::SeqCst) {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
                continue;
            }
        };

        let node = node.clone();
        let spawned = thread::Builder::new()
            .name(format!("tcp-{}-conn", node.me()))
            .spawn(move || {
                let served = stream
                    .set_nonblocking(false)
                    .map_err(Into::into)
                    .and_then(|_| Connection::new(stream, node))
                    .and_then(|mut conn| {
                        conn.set_timeouts(Some(IDLE_TIMEOUT), Some(write_timeout))?;
                        conn.handle()
                    });
                if let Err(e) = served {
                    tracing::debug!(peer = %addr, error = %e, "connection ended with error");
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(peer = %addr, error = %e, "could not spawn connection handler");
        }
    }
    tracing::debug!("acceptor stopped");
}
