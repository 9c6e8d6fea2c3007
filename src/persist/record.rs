//! Checksummed records
//!
//! A record is `crc32 (4, LE) | len (4, LE) | payload`; the CRC covers the
//! length and the payload.

use bytes::{Buf, BufMut};

use crate::error::{RaftKvError, Result};

/// Bytes of framing in front of every payload
pub const RECORD_HEADER_SIZE: usize = 8;

fn checksum(len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Append one record to `out`
pub fn put_record(out: &mut Vec<u8>, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        RaftKvError::Persist(format!("record too large: {} bytes", payload.len()))
    })?;
    out.reserve(RECORD_HEADER_SIZE + payload.len());
    out.put_u32_le(checksum(len, payload));
    out.put_u32_le(len);
    out.put_slice(payload);
    Ok(())
}

/// Read one record from the front of `buf`, advancing past it
pub fn take_record(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < RECORD_HEADER_SIZE {
        return Err(RaftKvError::CorruptState(format!(
            "truncated record header: {} bytes left",
            buf.remaining()
        )));
    }
    let crc = buf.get_u32_le();
    let len = buf.get_u32_le();
    if buf.remaining() < len as usize {
        return Err(RaftKvError::CorruptState(format!(
            "truncated record: expected {} bytes, found {}",
            len,
            buf.remaining()
        )));
    }
    let payload = buf[..len as usize].to_vec();
    buf.advance(len as usize);

    let actual = checksum(len, &payload);
    if actual != crc {
        return Err(RaftKvError::CorruptState(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            crc, actual
        )));
    }
    Ok(payload)
}
