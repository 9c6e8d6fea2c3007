//! KV Service Module
//!
//! A linearizable Get/Put/Append store replicated through [`crate::raft`].
//!
//! ## Responsibilities
//! - Submit client ops to the log and wait for them to be applied
//! - Apply committed ops exactly once per (client id, sequence number)
//! - Snapshot the applied state when the raft state outgrows its limit
//! - Client library ([`Clerk`]) with leader discovery and idempotent retry

mod client;
mod op;
mod server;
mod store;

pub use client::{Clerk, KvEndpoint, DEFAULT_OPERATION_DEADLINE};
pub use op::{ClientId, GetArgs, Op, OpKind, PutAppendArgs, PutMode};
pub use server::KvServer;
pub use store::KvState;
