//! Hash request handler.
//!
//! The transport hands every decoded frame to [`HashHandler::on_frame`] on an
//! event-loop thread. Validation and the payload copy happen there; the
//! digest itself runs on the business executor and the encoded response
//! re-enters the owning loop through the channel's task API.
//!
//! Request payload: `requestId:u64 | iterations:u32 | dataLength:u32 | data`.
//! Response payload: `requestId:u64 | iterations:u32 | hashLength:u32 | hash`.

use crate::buffer::BufferArena;
use crate::codec::{self, read_u32, read_u64, Frame, FrameType};
use crate::executor::BusinessExecutor;
use crate::reactor::{ChannelRef, FrameHandler};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

pub const MAX_ITERATIONS: u32 = 100;
pub const MAX_DATA_LENGTH: usize = 128;
pub const HASH_RESULT_SIZE: usize = 32;

/// requestId (8) + iterations (4) + dataLength (4).
pub const REQUEST_HEADER_SIZE: usize = 16;

/// requestId (8) + iterations (4) + hashLength (4) + hash (32).
pub const RESPONSE_PAYLOAD_SIZE: usize = 48;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request payload truncated: {0} bytes")]
    Truncated(usize),
    #[error("iterations {0} outside [1, {MAX_ITERATIONS}]")]
    IterationsOutOfRange(u32),
    #[error("data length {0} exceeds maximum {MAX_DATA_LENGTH}")]
    DataTooLong(usize),
    #[error("declared data length {declared} does not match remaining {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

/// A validated hash request with its data copied out of the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct HashRequest {
    pub request_id: u64,
    pub iterations: u32,
    pub data: Vec<u8>,
}

pub fn parse_request(payload: &[u8]) -> Result<HashRequest, RequestError> {
    if payload.len() < REQUEST_HEADER_SIZE {
        return Err(RequestError::Truncated(payload.len()));
    }

    let request_id = read_u64(payload);
    let iterations = read_u32(&payload[8..]);
    let declared = read_u32(&payload[12..]) as usize;
    let actual = payload.len() - REQUEST_HEADER_SIZE;

    if !(1..=MAX_ITERATIONS).contains(&iterations) {
        return Err(RequestError::IterationsOutOfRange(iterations));
    }
    if declared > MAX_DATA_LENGTH {
        return Err(RequestError::DataTooLong(declared));
    }
    if declared != actual {
        return Err(RequestError::LengthMismatch { declared, actual });
    }

    Ok(HashRequest {
        request_id,
        iterations,
        data: payload[REQUEST_HEADER_SIZE..].to_vec(),
    })
}

fn build_response_payload(
    request_id: u64,
    iterations: u32,
    hash: &[u8; HASH_RESULT_SIZE],
) -> [u8; RESPONSE_PAYLOAD_SIZE] {
    let mut payload = [0u8; RESPONSE_PAYLOAD_SIZE];
    payload[..8].copy_from_slice(&request_id.to_be_bytes());
    payload[8..12].copy_from_slice(&iterations.to_be_bytes());
    payload[12..16].copy_from_slice(&(HASH_RESULT_SIZE as u32).to_be_bytes());
    payload[16..].copy_from_slice(hash);
    payload
}

/// SHA-256 applied `iterations` times: the first pass digests `data`, each
/// further pass digests the previous digest.
///
/// `live` is polled between passes; returns `None` when the caller went away
/// so abandoned requests stop burning CPU.
fn iterated_digest(
    data: &[u8],
    iterations: u32,
    live: impl Fn() -> bool,
) -> Option<[u8; HASH_RESULT_SIZE]> {
    let mut hash: [u8; HASH_RESULT_SIZE] = Sha256::digest(data).into();
    for _ in 1..iterations {
        if !live() {
            return None;
        }
        hash = Sha256::digest(hash).into();
    }
    Some(hash)
}

/// Reference business handler: iterated SHA-256 over framed requests.
pub struct HashHandler {
    executor: Arc<BusinessExecutor>,
    arena: Arc<BufferArena>,
}

impl HashHandler {
    pub fn new(executor: Arc<BusinessExecutor>, arena: Arc<BufferArena>) -> Self {
        Self { executor, arena }
    }
}

impl FrameHandler for HashHandler {
    fn on_frame(&self, frame: &Frame<'_>, channel: &ChannelRef) {
        if frame.frame_type != FrameType::HashRequest {
            // A response-typed frame in the client-to-server direction is
            // ignored; the connection stays up.
            warn!(
                channel = channel.channel_id(),
                frame_type = ?frame.frame_type,
                "unexpected frame type, ignoring"
            );
            return;
        }

        let request = match parse_request(frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(channel = channel.channel_id(), error = %e, "invalid hash request");
                channel.close();
                return;
            }
        };

        let arena = Arc::clone(&self.arena);
        let channel = channel.clone();
        let submitted = self
            .executor
            .try_submit(move || run_hash_job(request, channel, &arena));
        if let Err(e) = submitted {
            // Documented shedding policy: the request is dropped, the
            // connection stays up, and no response is sent.
            warn!(error = %e, "hash request dropped");
        }
    }
}

fn run_hash_job(request: HashRequest, channel: ChannelRef, arena: &BufferArena) {
    if !channel.is_open() {
        return;
    }

    let Some(hash) = iterated_digest(&request.data, request.iterations, || channel.is_open())
    else {
        return;
    };
    if !channel.is_open() {
        return;
    }

    let payload = build_response_payload(request.request_id, request.iterations, &hash);
    match codec::encode(arena, FrameType::HashResponse, &payload) {
        Ok(buf) => channel.send_response(buf),
        Err(e) => {
            error!(channel = channel.channel_id(), error = %e, "failed to encode response");
            channel.close();
        }
    }
}
