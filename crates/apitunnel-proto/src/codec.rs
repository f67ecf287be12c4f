//! Length-prefixed frame codec.
//!
//! Wire layout, big-endian:
//!
//! ```text
//! correlation_id: u64 | frame_type: u8 | length: u32 | payload: [u8; length]
//! ```
//!
//! The decoder is fed arbitrary byte chunks by `FramedRead` and yields a
//! frame only once its full payload is buffered. The length field is checked
//! before any payload is reserved, so a hostile peer cannot make us allocate
//! more than `max_payload` per frame.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, FrameType};

/// Fixed header size: 8-byte correlation ID, 1-byte type, 4-byte length.
pub const HEADER_LEN: usize = 13;

/// Default per-frame payload bound (64 KiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Largest payload bound a configuration may select (16 MiB).
pub const MAX_PAYLOAD_CEILING: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unknown frame type code {0}")]
    UnknownFrameType(u8),

    #[error("Frame payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame codec with a configurable payload bound.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub const fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let correlation_id = header.get_u64();
        let code = header.get_u8();
        let len = header.get_u32() as usize;

        let frame_type = FrameType::from_code(code).ok_or(CodecError::UnknownFrameType(code))?;
        if len > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            correlation_id,
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        // max_payload is capped well below u32::MAX by settings validation
        let wire_len = u32::try_from(len).map_err(|_| CodecError::PayloadTooLarge {
            len,
            max: self.max_payload,
        })?;

        dst.reserve(HEADER_LEN + len);
        dst.put_u64(frame.correlation_id);
        dst.put_u8(frame.frame_type.code());
        dst.put_u32(wire_len);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
