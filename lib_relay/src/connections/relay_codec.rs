//! # `<END>` Delimited Codec
//!
//! The upstream peer speaks a raw byte stream where each frame is arbitrary
//! bytes followed by the literal marker `<END>`. This codec plugs that framing
//! into `tokio_util::codec::{FramedRead, FramedWrite}`.
//!
//! Frame bodies are not escaped, so a sealed payload whose ciphertext happens
//! to contain `<END>` is split by the peer. The protocol accepts that risk.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The literal frame terminator.
pub const FRAME_DELIMITER: &[u8] = b"<END>";

/// Upper bound for a buffered, still undelimited frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Splits an inbound stream on `<END>` and appends it to outbound frames.
#[derive(Debug, Clone)]
pub struct EndDelimitedCodec {
    /// Offset in the read buffer where the next delimiter search resumes.
    next_index: usize,
    max_frame_length: usize,
}

impl EndDelimitedCodec {
    /// Creates a codec that rejects frames longer than `max_frame_length`.
    pub fn with_max_length(max_frame_length: usize) -> Self {
        Self {
            next_index: 0,
            max_frame_length,
        }
    }
}

impl Default for EndDelimitedCodec {
    fn default() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for EndDelimitedCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        let from = self.next_index.min(buf.len());

        if let Some(offset) = buf[from..]
            .windows(FRAME_DELIMITER.len())
            .position(|window| window == FRAME_DELIMITER)
        {
            let frame = buf.split_to(from + offset);
            buf.advance(FRAME_DELIMITER.len());
            self.next_index = 0;
            return Ok(Some(frame));
        }

        if buf.len() > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame exceeds {} bytes without a delimiter",
                    self.max_frame_length
                ),
            ));
        }

        // A delimiter may straddle the next read, so keep its prefix searchable.
        self.next_index = buf.len().saturating_sub(FRAME_DELIMITER.len() - 1);
        Ok(None)
    }
}

impl Encoder<Vec<u8>> for EndDelimitedCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(payload.len() + FRAME_DELIMITER.len());
        dst.put_slice(&payload);
        dst.put_slice(FRAME_DELIMITER);
        Ok(())
    }
}
