//! Length-prefixed framing for stream transports.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

/// Maximum frame size (1MB). Large enough for a base64 chunk message.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length of the big-endian size prefix
pub const HEADER_LEN: usize = 4;

/// Framing error
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Length-prefixed frame codec
#[derive(Clone, Copy, Debug)]
pub struct LengthCodec {
    max_frame_size: usize,
}

impl LengthCodec {
    /// Create a new codec with the specified maximum frame size
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode data with length prefix
    /// Format: length (4 bytes BE) || data
    pub fn encode(&self, data: &[u8]) -> Result<Bytes, FramingError> {
        if data.len() > self.max_frame_size {
            return Err(FramingError::TooLarge(data.len(), self.max_frame_size));
        }

        let mut encoded = BytesMut::with_capacity(HEADER_LEN + data.len());
        encoded.put_u32(data.len() as u32);
        encoded.extend_from_slice(data);
        Ok(encoded.freeze())
    }

    /// Decode a single complete frame
    pub fn decode(&self, framed: &[u8]) -> Result<Bytes, FramingError> {
        if framed.len() < HEADER_LEN {
            return Err(FramingError::Incomplete(HEADER_LEN - framed.len()));
        }

        let mut buf = framed;
        let len = buf.get_u32() as usize;

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        if buf.remaining() < len {
            return Err(FramingError::Incomplete(len - buf.remaining()));
        }

        Ok(Bytes::copy_from_slice(&buf[..len]))
    }

    /// Streaming decoder for partial reads.
    /// Returns `Some(frame)` when a complete frame is buffered, `None` if more data is needed.
    pub fn decode_stream(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = {
            let mut len_buf = &buf[..HEADER_LEN];
            len_buf.get_u32() as usize
        };

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

impl Default for LengthCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}
