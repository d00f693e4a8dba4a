//! Wire codec for the client protocol
//!
//! # Frame layout
//!
//! ```text
//! +-----------+----------------------+------------------+---------+------+
//! | "CPv1"    | Length (u32 LE)      | Sequence (u16 LE)| Opcode  | Body |
//! +-----------+----------------------+------------------+---------+------+
//! ```
//!
//! The length covers the whole frame, header included. Strings are a `u32` LE
//! length followed by raw bytes. The sequence number ties a response to the
//! request it answers; the service sends exactly one terminal frame (check
//! response or cancel response) per sequence number.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;

use crate::decision::{CheckKey, CheckKind, CheckResult, PolicyType};

/// Frame signature
pub const SIGNATURE: &[u8; 4] = b"CPv1";

/// Signature, length and sequence number
pub const HEADER_LEN: usize = 4 + 4 + 2;

/// Smallest valid frame: a header and an opcode
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Smallest check response: policy type, empty metadata and TTL
pub const MIN_CHECK_RESPONSE_LEN: usize = MIN_FRAME_LEN + 2 + 4 + 4;

const OP_CHECK_REQUEST: u8 = 0;
const OP_CHECK_RESPONSE: u8 = 1;
const OP_CANCEL_REQUEST: u8 = 2;
const OP_CANCEL_RESPONSE: u8 = 3;
const OP_SIMPLE_CHECK_REQUEST: u8 = 4;
const OP_SIMPLE_CHECK_RESPONSE: u8 = 5;

/// Wire-level sequence number
pub type Sequence = u16;

/// Errors raised while decoding frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid frame signature {0:02x?}")]
    InvalidSignature([u8; 4]),

    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame too short: {size} bytes")]
    FrameTooShort { size: usize },

    #[error("unexpected opcode {0}")]
    UnknownOpcode(u8),

    #[error("truncated {field} field")]
    Truncated { field: &'static str },

    #[error("{field} field is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("invalid check key: {0}")]
    InvalidKey(String),

    #[error("{remaining} trailing bytes after message body")]
    TrailingBytes { remaining: usize },
}

/// Client-to-service message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Check {
        seq: Sequence,
        kind: CheckKind,
        key: CheckKey,
    },
    Cancel {
        seq: Sequence,
    },
}

/// Service-to-client message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Check {
        seq: Sequence,
        kind: CheckKind,
        result: CheckResult,
    },
    Cancel {
        seq: Sequence,
    },
}

impl Response {
    pub fn seq(&self) -> Sequence {
        match self {
            Response::Check { seq, .. } | Response::Cancel { seq } => *seq,
        }
    }
}

/// Append a request frame to `dst`
pub fn encode_request(request: &Request, dst: &mut BytesMut) {
    match request {
        Request::Check { seq, kind, key } => {
            let opcode = match kind {
                CheckKind::Full => OP_CHECK_REQUEST,
                CheckKind::Simple => OP_SIMPLE_CHECK_REQUEST,
            };
            write_frame(dst, *seq, opcode, |body| {
                for field in [key.client(), key.session(), key.user(), key.privilege()] {
                    put_bytes(body, field);
                }
            });
        }
        Request::Cancel { seq } => write_frame(dst, *seq, OP_CANCEL_REQUEST, |_| {}),
    }
}

/// Append a response frame to `dst`
pub fn encode_response(response: &Response, dst: &mut BytesMut) {
    match response {
        Response::Check { seq, kind, result } => {
            let opcode = match kind {
                CheckKind::Full => OP_CHECK_RESPONSE,
                CheckKind::Simple => OP_SIMPLE_CHECK_RESPONSE,
            };
            write_frame(dst, *seq, opcode, |body| {
                body.put_u16_le(result.policy_type.0);
                put_bytes(body, result.metadata.as_deref().unwrap_or_default().as_bytes());
                let ttl_secs = result
                    .ttl
                    .map_or(0, |ttl| u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX));
                body.put_u32_le(ttl_secs);
            });
        }
        Response::Cancel { seq } => write_frame(dst, *seq, OP_CANCEL_RESPONSE, |_| {}),
    }
}

/// Decode the next complete response from `src`, consuming it
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame.
pub fn decode_response(src: &mut BytesMut, max_len: usize) -> Result<Option<Response>, ProtocolError> {
    let Some((seq, opcode, mut body)) = next_frame(src, max_len)? else {
        return Ok(None);
    };
    let response = match opcode {
        OP_CHECK_RESPONSE | OP_SIMPLE_CHECK_RESPONSE => {
            let kind = if opcode == OP_CHECK_RESPONSE {
                CheckKind::Full
            } else {
                CheckKind::Simple
            };
            let policy_type = PolicyType(take_u16(&mut body, "policy type")?);
            let metadata = take_bytes(&mut body, "metadata")?;
            let metadata = String::from_utf8(metadata.to_vec())
                .map_err(|_| ProtocolError::InvalidUtf8 { field: "metadata" })?;
            let ttl_secs = take_u32(&mut body, "ttl")?;
            Response::Check {
                seq,
                kind,
                result: CheckResult {
                    policy_type,
                    metadata: (!metadata.is_empty()).then_some(metadata),
                    ttl: (ttl_secs != 0).then(|| Duration::from_secs(u64::from(ttl_secs))),
                },
            }
        }
        OP_CANCEL_RESPONSE => Response::Cancel { seq },
        other => return Err(ProtocolError::UnknownOpcode(other)),
    };
    ensure_consumed(&body)?;
    Ok(Some(response))
}

/// Decode the next complete request from `src`, consuming it
///
/// This is the service side of the codec, used by test doubles of the service.
pub fn decode_request(src: &mut BytesMut, max_len: usize) -> Result<Option<Request>, ProtocolError> {
    let Some((seq, opcode, mut body)) = next_frame(src, max_len)? else {
        return Ok(None);
    };
    let request = match opcode {
        OP_CHECK_REQUEST | OP_SIMPLE_CHECK_REQUEST => {
            let kind = if opcode == OP_CHECK_REQUEST {
                CheckKind::Full
            } else {
                CheckKind::Simple
            };
            let client = take_bytes(&mut body, "client")?;
            let session = take_bytes(&mut body, "session")?;
            let user = take_bytes(&mut body, "user")?;
            let privilege = take_bytes(&mut body, "privilege")?;
            let key = CheckKey::new(client, session, user, privilege)
                .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
            Request::Check { seq, kind, key }
        }
        OP_CANCEL_REQUEST => Request::Cancel { seq },
        other => return Err(ProtocolError::UnknownOpcode(other)),
    };
    ensure_consumed(&body)?;
    Ok(Some(request))
}

fn write_frame(dst: &mut BytesMut, seq: Sequence, opcode: u8, body: impl FnOnce(&mut BytesMut)) {
    let start = dst.len();
    dst.put_slice(SIGNATURE);
    // Length is patched once the body is known.
    dst.put_u32_le(0);
    dst.put_u16_le(seq);
    dst.put_u8(opcode);
    body(dst);
    let len = (dst.len() - start) as u32;
    dst[start + 4..start + 8].copy_from_slice(&len.to_le_bytes());
}

fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32_le(value.len() as u32);
    dst.put_slice(value);
}

/// Split the next complete frame off `src` as (sequence, opcode, body)
fn next_frame(
    src: &mut BytesMut,
    max_len: usize,
) -> Result<Option<(Sequence, u8, Bytes)>, ProtocolError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut signature = [0u8; 4];
    signature.copy_from_slice(&src[..4]);
    if &signature != SIGNATURE {
        return Err(ProtocolError::InvalidSignature(signature));
    }
    let len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
    if len < MIN_FRAME_LEN {
        return Err(ProtocolError::FrameTooShort { size: len });
    }
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { size: len, max: max_len });
    }
    if src.len() < len {
        src.reserve(len - src.len());
        return Ok(None);
    }
    let mut frame = src.split_to(len).freeze();
    frame.advance(8);
    let seq = frame.get_u16_le();
    let opcode = frame.get_u8();
    Ok(Some((seq, opcode, frame)))
}

fn take_u16(body: &mut Bytes, field: &'static str) -> Result<u16, ProtocolError> {
    if body.remaining() < 2 {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(body.get_u16_le())
}

fn take_u32(body: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    if body.remaining() < 4 {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(body.get_u32_le())
}

fn take_bytes(body: &mut Bytes, field: &'static str) -> Result<Bytes, ProtocolError> {
    let len = take_u32(body, field)? as usize;
    if body.remaining() < len {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(body.split_to(len))
}

fn ensure_consumed(body: &Bytes) -> Result<(), ProtocolError> {
    if body.has_remaining() {
        return Err(ProtocolError::TrailingBytes {
            remaining: body.remaining(),
        });
    }
    Ok(())
}
