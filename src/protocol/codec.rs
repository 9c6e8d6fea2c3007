//! Protocol codec
//!
//! Encoding and decoding of kind-tagged, length-prefixed frames.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use super::{MessageKind, WireMessage};
use crate::error::{RaftKvError, Result};

/// Header size: 1 byte kind + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (64 MB, large enough for snapshots)
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

// =============================================================================
// Message Encoding/Decoding
// =============================================================================

/// Encode a message into a complete frame
pub fn encode<T: WireMessage>(message: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(RaftKvError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u8(T::KIND as u8);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.to_vec())
}

/// Decode a complete frame as `T`
///
/// Fails if the header is truncated, the kind byte belongs to another
/// schema, or the payload is shorter than announced.
pub fn decode<T: WireMessage>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_SIZE {
        return Err(RaftKvError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let mut header = &bytes[..HEADER_SIZE];
    let kind_byte = header.get_u8();
    let payload_len = header.get_u32() as usize;

    match MessageKind::from_byte(kind_byte) {
        Some(kind) if kind == T::KIND => {}
        Some(kind) => {
            return Err(RaftKvError::Protocol(format!(
                "Unexpected message kind {:?}, expected {:?}",
                kind,
                T::KIND
            )))
        }
        None => {
            return Err(RaftKvError::Protocol(format!(
                "Unknown message kind: 0x{:02x}",
                kind_byte
            )))
        }
    }

    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(RaftKvError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let total_len = HEADER_SIZE + payload_len;
    if bytes.len() < total_len {
        return Err(RaftKvError::Protocol(format!(
            "Incomplete payload: expected {} bytes, got {}",
            total_len,
            bytes.len()
        )));
    }

    Ok(bincode::deserialize(&bytes[HEADER_SIZE..total_len])?)
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read one complete frame (header + payload) from a stream
///
/// Blocks until the frame is received or an error occurs
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(RaftKvError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = vec![0u8; HEADER_SIZE + payload_len];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    if payload_len > 0 {
        reader.read_exact(&mut frame[HEADER_SIZE..])?;
    }
    Ok(frame)
}

/// Encode a message and write it to a stream
pub fn write_frame<W: Write, T: WireMessage>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = encode(message)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
