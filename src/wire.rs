//! Wire protocol: opcode table, framed primitives, notification frames.
//!
//! Everything on the wire is a concatenation of fixed-layout primitives:
//! `u8`, little-endian `i64`, length-prefixed byte strings (i64 length +
//! raw bytes) and vectors of byte strings (i64 count + that many byte
//! strings). There is no request-level framing; each side reads exactly
//! what the opcode's layout demands, so losing sync is irrecoverable and
//! terminates the connection.

use std::io::{ErrorKind, Read, Write};

use thiserror::Error;

/// Upper bound for a single key or value on the wire.
pub const MAX_VALUE_BYTES: i64 = 8 * 1024 * 1024;
/// Upper bound for the number of keys in one CHECK/WAIT request.
pub const MAX_VEC_KEYS: i64 = 1024;

/// Reply byte for WAIT once every requested key exists.
pub const STOP_WAITING: u8 = 0x00;
/// Reply bytes for CHECK.
pub const CHECK_READY: u8 = 0x00;
pub const CHECK_NOT_READY: u8 = 0x01;
/// Reply bytes for DELETE_KEY.
pub const DELETE_DONE: u8 = 0x01;
pub const DELETE_MISSING: u8 = 0x00;

/// Request opcodes. Numeric values are fixed for wire compatibility and
/// must never be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Set = 0,
    CompareSet = 1,
    Get = 2,
    Add = 3,
    Check = 4,
    Wait = 5,
    GetNumKeys = 6,
    DeleteKey = 7,
    WatchKey = 8,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Opcode::Set),
            1 => Ok(Opcode::CompareSet),
            2 => Ok(Opcode::Get),
            3 => Ok(Opcode::Add),
            4 => Ok(Opcode::Check),
            5 => Ok(Opcode::Wait),
            6 => Ok(Opcode::GetNumKeys),
            7 => Ok(Opcode::DeleteKey),
            8 => Ok(Opcode::WatchKey),
            other => Err(WireError::Protocol(format!("unknown opcode {other:#04x}"))),
        }
    }
}

/// Trailing tag of a listener-channel frame.
///
/// `Ack` confirms a WATCH_KEY registration; the remaining tags describe
/// the mutation that produced the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchTag {
    Ack = 0,
    Created = 1,
    Updated = 2,
    Deleted = 3,
    Appended = 4,
}

impl TryFrom<u8> for WatchTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(WatchTag::Ack),
            1 => Ok(WatchTag::Created),
            2 => Ok(WatchTag::Updated),
            3 => Ok(WatchTag::Deleted),
            4 => Ok(WatchTag::Appended),
            other => Err(WireError::Protocol(format!("unknown watch tag {other:#04x}"))),
        }
    }
}

/// One frame on a client's listener socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub key: Vec<u8>,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
    pub tag: WatchTag,
}

#[derive(Debug, Error)]
pub enum WireError {
    /// Any I/O failure or unexpected EOF. Framing cannot be resynchronized
    /// afterwards, so the connection must be abandoned.
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    /// Unknown opcode, unknown tag, or an impossible length.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::ConnectionLost(err)
    }
}

impl WireError {
    /// True when the underlying I/O failure was a receive-timeout expiry
    /// rather than a dead peer.
    pub fn is_timeout(&self) -> bool {
        match self {
            WireError::ConnectionLost(err) => {
                matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
            }
            WireError::Protocol(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read one opcode byte. `Ok(None)` means the peer closed the connection
/// cleanly before starting a request; EOF anywhere else is an error.
pub fn read_opcode(r: &mut impl Read) -> Result<Option<Opcode>, WireError> {
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Opcode::try_from(byte[0]).map(Some),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(WireError::ConnectionLost(err)),
        }
    }
}

pub fn read_u8(r: &mut impl Read) -> Result<u8, WireError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_i64(r: &mut impl Read) -> Result<i64, WireError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Read one length-prefixed byte string.
pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, WireError> {
    let len = read_i64(r)?;
    if !(0..=MAX_VALUE_BYTES).contains(&len) {
        return Err(WireError::Protocol(format!("impossible byte length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a vector of byte strings (CHECK/WAIT key lists).
pub fn read_key_vec(r: &mut impl Read) -> Result<Vec<Vec<u8>>, WireError> {
    let count = read_i64(r)?;
    if !(0..=MAX_VEC_KEYS).contains(&count) {
        return Err(WireError::Protocol(format!("impossible key count {count}")));
    }
    let mut keys = Vec::with_capacity(count as usize);
    for _ in 0..count {
        keys.push(read_bytes(r)?);
    }
    Ok(keys)
}

pub fn read_notification(r: &mut impl Read) -> Result<Notification, WireError> {
    let key = read_bytes(r)?;
    let old = read_bytes(r)?;
    let new = read_bytes(r)?;
    let tag = WatchTag::try_from(read_u8(r)?)?;
    Ok(Notification { key, old, new, tag })
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------
//
// Requests and replies are assembled into a buffer and sent with a single
// write so a request never straddles a partial-write failure.

pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_i64(buf, bytes.len() as i64);
    buf.extend_from_slice(bytes);
}

pub fn put_key_vec(buf: &mut Vec<u8>, keys: &[Vec<u8>]) {
    put_i64(buf, keys.len() as i64);
    for key in keys {
        put_bytes(buf, key);
    }
}

pub fn put_notification(buf: &mut Vec<u8>, key: &[u8], old: &[u8], new: &[u8], tag: WatchTag) {
    put_bytes(buf, key);
    put_bytes(buf, old);
    put_bytes(buf, new);
    put_u8(buf, tag as u8);
}

/// Deliver a fully assembled message, or fail with `ConnectionLost`.
pub fn send(w: &mut impl Write, buf: &[u8]) -> Result<(), WireError> {
    w.write_all(buf)?;
    w.flush()?;
    Ok(())
}
