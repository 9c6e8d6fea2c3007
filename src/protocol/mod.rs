//! Protocol Module
//!
//! Wire encoding shared by RPCs, the TCP front end and persisted bytes.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │     Payload (bincode)       │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Registered Kinds
//! - 0x01: RPC_REQUEST       - RequestVote / AppendEntries / InstallSnapshot
//! - 0x02: RPC_REPLY         - replies to the above
//! - 0x03: PERSISTENT_STATE  - term, vote, log, snapshot point
//! - 0x04: KV_SNAPSHOT       - store, client sequence table, applied index
//! - 0x05: KV_OP             - a KV command carried inside a log entry
//! - 0x06: REQUEST           - TCP request envelope
//! - 0x07: RESPONSE          - TCP response envelope
//!
//! Decoding checks the kind byte, so bytes of one schema can never be
//! silently read back as another.

mod codec;
mod command;
mod response;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use codec::{decode, encode, read_frame, write_frame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use command::Request;
pub use response::Response;

/// Registered message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    RpcRequest = 0x01,
    RpcReply = 0x02,
    PersistentState = 0x03,
    KvSnapshot = 0x04,
    KvOp = 0x05,
    Request = 0x06,
    Response = 0x07,
}

impl MessageKind {
    /// Map a header byte back to its kind
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MessageKind::RpcRequest),
            0x02 => Some(MessageKind::RpcReply),
            0x03 => Some(MessageKind::PersistentState),
            0x04 => Some(MessageKind::KvSnapshot),
            0x05 => Some(MessageKind::KvOp),
            0x06 => Some(MessageKind::Request),
            0x07 => Some(MessageKind::Response),
            _ => None,
        }
    }
}

/// A type with a registered frame kind
pub trait WireMessage: Serialize + DeserializeOwned {
    const KIND: MessageKind;
}
