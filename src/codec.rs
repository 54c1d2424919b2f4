//! Wire codec for the length-prefixed frame protocol.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! length:u32 | type:u16 | payload:length bytes
//! ```
//!
//! `length` counts payload bytes only. Decoding is a pure function of a byte
//! slice: incomplete frames consume nothing (the caller keeps accumulating),
//! and decoded payloads are zero-copy views into the input. There is no
//! resynchronization: an oversized length or unknown type means the framing
//! can no longer be trusted, and the connection must close.

use crate::buffer::{BufferArena, PooledBuf, SizeClass};
use thiserror::Error;

/// Frame header: length (4 bytes) + type (2 bytes).
pub const HEADER_SIZE: usize = 6;

/// Payloads above this bound are a protocol error.
pub const MAX_PAYLOAD_SIZE: usize = 256;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    HashRequest,
    HashResponse,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Option<FrameType> {
        match value {
            1 => Some(FrameType::HashRequest),
            2 => Some(FrameType::HashResponse),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            FrameType::HashRequest => 1,
            FrameType::HashResponse => 2,
        }
    }
}

/// One decoded frame. The payload borrows the accumulation buffer it was
/// decoded from and must not outlive it.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub frame_type: FrameType,
    pub payload: &'a [u8],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),
    #[error("unknown frame type {0}")]
    UnknownType(u16),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoded frame size {size} exceeds response buffer capacity {capacity}")]
    FrameTooLarge { size: usize, capacity: usize },
}

/// Decode every complete frame in `input`.
///
/// Returns the frames in arrival order and the number of bytes consumed.
/// A trailing partial frame (short header or short payload) consumes
/// nothing past the last complete frame.
pub fn decode(input: &[u8]) -> Result<(Vec<Frame<'_>>, usize), DecodeError> {
    let mut frames = Vec::new();
    let mut cursor = 0;

    loop {
        let remaining = &input[cursor..];
        if remaining.len() < HEADER_SIZE {
            break;
        }

        let length = read_u32(remaining) as usize;
        let raw_type = read_u16(&remaining[4..]);

        if length > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::PayloadTooLarge(length));
        }
        let frame_type = match FrameType::from_u16(raw_type) {
            Some(t) => t,
            None => return Err(DecodeError::UnknownType(raw_type)),
        };
        if remaining.len() < HEADER_SIZE + length {
            break;
        }

        let start = cursor + HEADER_SIZE;
        frames.push(Frame {
            frame_type,
            payload: &input[start..start + length],
        });
        cursor += HEADER_SIZE + length;
    }

    Ok((frames, cursor))
}

/// Encode one frame into a response-class buffer from the arena.
///
/// Never truncates: a frame that does not fit the response class fails.
pub fn encode(
    arena: &BufferArena,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<PooledBuf, EncodeError> {
    let mut buf = arena.acquire(SizeClass::Response);
    let size = HEADER_SIZE + payload.len();
    if size > buf.capacity() {
        let capacity = buf.capacity();
        arena.release(buf);
        return Err(EncodeError::FrameTooLarge { size, capacity });
    }

    buf.put_slice(&(payload.len() as u32).to_be_bytes());
    buf.put_slice(&frame_type.as_u16().to_be_bytes());
    buf.put_slice(payload);
    Ok(buf)
}

pub(crate) fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub(crate) fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn read_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
