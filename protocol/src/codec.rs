//! Length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON-encoded [`Envelope`]. The length covers the JSON only, not itself.

use crate::{Envelope, Payload, MAX_MESSAGE_SIZE};

pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length prefix exceeds the configured maximum. The stream cannot
    /// be resynchronised after this.
    #[error("frame length {size} exceeds maximum {max}")]
    Oversized { size: u64, max: u32 },

    /// A complete frame whose body is not a valid envelope. The frame's
    /// bytes are known, so the stream stays usable.
    #[error("malformed frame of {consumed} bytes: {reason}")]
    Malformed {
        consumed: usize,
        message_id: Option<String>,
        unknown_kind: Option<String>,
        reason: String,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl FrameError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed { .. })
    }
}

/// Outcome of a decode attempt that did not fail.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Frame { envelope: Envelope, consumed: usize },
    NeedMoreData,
}

/// Encode an envelope as one frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    encode_with_limit(envelope, MAX_MESSAGE_SIZE)
}

pub fn encode_with_limit(envelope: &Envelope, max: u32) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(envelope)?;
    if json.len() as u64 > max as u64 {
        return Err(FrameError::Oversized {
            size: json.len() as u64,
            max,
        });
    }
    let len = json.len() as u32;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Try to decode one frame from the front of `buf` without consuming it.
pub fn decode_frame(buf: &[u8], max: u32) -> Result<Decoded, FrameError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(Decoded::NeedMoreData);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > max {
        return Err(FrameError::Oversized {
            size: len as u64,
            max,
        });
    }
    let total = LENGTH_PREFIX_SIZE + len as usize;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let body = &buf[LENGTH_PREFIX_SIZE..total];
    match serde_json::from_slice::<Envelope>(body) {
        Ok(envelope) => Ok(Decoded::Frame {
            envelope,
            consumed: total,
        }),
        Err(e) => Err(malformed(body, total, e)),
    }
}

/// Salvage the id and type tag of an undecodable frame so the receiver can
/// still answer its sender.
fn malformed(body: &[u8], consumed: usize, err: serde_json::Error) -> FrameError {
    let value: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let message_id = value
        .as_ref()
        .and_then(|v| v.get("message_id"))
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let unknown_kind = value
        .as_ref()
        .and_then(|v| v.get("payload"))
        .and_then(|p| p.get("type"))
        .and_then(|t| t.as_str())
        .filter(|tag| !Payload::is_known_kind(tag))
        .map(str::to_owned);
    FrameError::Malformed {
        consumed,
        message_id,
        unknown_kind,
        reason: err.to_string(),
    }
}

/// Incremental decoder fed with arbitrary byte chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_frame(max_frame: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete envelope, or `Ok(None)` if more bytes are needed.
    ///
    /// A malformed frame is dropped from the buffer before its error is
    /// returned, so decoding can continue. An oversized frame leaves the
    /// buffer untouched; the caller must [`reset`](Self::reset) it.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>, FrameError> {
        match decode_frame(&self.buf, self.max_frame) {
            Ok(Decoded::Frame { envelope, consumed }) => {
                self.buf.drain(..consumed);
                Ok(Some(envelope))
            }
            Ok(Decoded::NeedMoreData) => Ok(None),
            Err(err) => {
                if let FrameError::Malformed { consumed, .. } = &err {
                    self.buf.drain(..*consumed);
                }
                Err(err)
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
