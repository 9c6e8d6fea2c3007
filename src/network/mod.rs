//! Network Module
//!
//! TCP deployment of a node: one listener per node serving both peers
//! (consensus RPCs) and clients (Get/PutAppend).
//!
//! ## Architecture
//! - Single acceptor thread per node
//! - One thread per connection, requests served in order
//! - Outbound calls open a fresh connection bounded by a timeout

mod client;
mod connection;
mod server;

pub use client::{TcpKvEndpoint, TcpTransport};
pub use connection::Connection;
pub use server::Server;
