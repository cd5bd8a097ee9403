//! Length-delimited JSON framing for control streams
//!
//! Every wire message is a 4-byte big-endian length prefix followed by
//! UTF-8 JSON payload bytes. The decoder is a pull-based reassembler: it
//! accumulates arbitrary-sized input chunks and yields zero or more
//! complete frames per chunk, preserving partial frames across calls.
//!
//! A maximum frame length bounds buffering. A frame declaring a length
//! beyond the maximum fails the stream before any payload bytes are
//! buffered.

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, Result};

/// Maximum allowed frame payload length in bytes.
pub const MAX_FRAME_LEN: usize = 512_000;

/// Length prefix size in bytes.
const PREFIX_LEN: usize = 4;

/// Encode a payload with a 4-byte big-endian length prefix.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    encode_frame_limited(payload, MAX_FRAME_LEN)
}

/// Encode with an explicit maximum, for callers with a tuned limit.
pub fn encode_frame_limited(payload: &[u8], max_len: usize) -> Result<Vec<u8>> {
    if payload.len() > max_len {
        return Err(ProtocolError::FrameTooLarge(payload.len(), max_len));
    }
    let mut buf = Vec::with_capacity(PREFIX_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Pull-based frame reassembler.
///
/// Feed chunks with [`FrameDecoder::extend`], then drain complete frames
/// with [`FrameDecoder::next_frame`] until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_len: usize,
    /// Set once the stream has produced an oversize declaration; the
    /// decoder refuses further use because the byte stream is no longer
    /// in sync with frame boundaries.
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
            poisoned: false,
        }
    }

    /// Append an input chunk to the reassembly buffer.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Try to pull the next complete frame payload.
    ///
    /// Returns `Ok(Some(payload))` when a complete frame is buffered,
    /// `Ok(None)` when more input is needed, or an error if the declared
    /// length exceeds the maximum. The error is sticky: once the stream
    /// declares an oversize frame it cannot be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.poisoned {
            return Err(ProtocolError::ProtocolViolation(
                "frame stream out of sync after oversize frame".to_string(),
            ));
        }

        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;

        if declared > self.max_len {
            self.poisoned = true;
            return Err(ProtocolError::FrameTooLarge(declared, self.max_len));
        }

        if self.buf.len() < PREFIX_LEN + declared {
            return Ok(None);
        }

        self.buf.advance(PREFIX_LEN);
        let payload = self.buf.split_to(declared);
        Ok(Some(payload.to_vec()))
    }

    /// Bytes currently buffered (incomplete frame data).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
