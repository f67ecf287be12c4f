//! Frame and frame type definitions.

use bytes::Bytes;

/// Frame type discriminant as carried in the one-byte type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    RequestHeader = 1,
    RequestBodyChunk = 2,
    RequestEnd = 3,
    ResponseHeader = 4,
    ResponseBodyChunk = 5,
    ResponseEnd = 6,
    Cancel = 7,
    Error = 8,
    /// Grants the peer more send credit on a stream.
    WindowUpdate = 9,
    /// Session keepalive, always on correlation ID 0.
    Ping = 10,
}

impl FrameType {
    /// Decode a wire code. Returns `None` for unassigned codes.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::RequestHeader),
            2 => Some(Self::RequestBodyChunk),
            3 => Some(Self::RequestEnd),
            4 => Some(Self::ResponseHeader),
            5 => Some(Self::ResponseBodyChunk),
            6 => Some(Self::ResponseEnd),
            7 => Some(Self::Cancel),
            8 => Some(Self::Error),
            9 => Some(Self::WindowUpdate),
            10 => Some(Self::Ping),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Frames that only the request side (Bridge) may emit.
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestHeader | Self::RequestBodyChunk | Self::RequestEnd
        )
    }

    /// Frames that only the response side (Offramp) may emit.
    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Self::ResponseHeader | Self::ResponseBodyChunk | Self::ResponseEnd
        )
    }

    /// Body chunks, the only frames that consume flow-control credit.
    pub const fn is_body(self) -> bool {
        matches!(self, Self::RequestBodyChunk | Self::ResponseBodyChunk)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestHeader => "request_header",
            Self::RequestBodyChunk => "request_body_chunk",
            Self::RequestEnd => "request_end",
            Self::ResponseHeader => "response_header",
            Self::ResponseBodyChunk => "response_body_chunk",
            Self::ResponseEnd => "response_end",
            Self::Cancel => "cancel",
            Self::Error => "error",
            Self::WindowUpdate => "window_update",
            Self::Ping => "ping",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single wire frame: one typed, length-delimited payload tagged with
/// the correlation ID of the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: u64,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(correlation_id: u64, frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            frame_type,
            payload: payload.into(),
        }
    }

    /// A frame with no payload (End frames, bare Cancel).
    pub const fn empty(correlation_id: u64, frame_type: FrameType) -> Self {
        Self {
            correlation_id,
            frame_type,
            payload: Bytes::new(),
        }
    }

    pub fn cancel(correlation_id: u64, reason: &str) -> Self {
        Self::new(
            correlation_id,
            FrameType::Cancel,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Credit grant: a big-endian `u32` byte count.
    pub fn window_update(correlation_id: u64, increment: u32) -> Self {
        Self::new(
            correlation_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    pub const fn ping() -> Self {
        Self::empty(0, FrameType::Ping)
    }

    /// Credit carried by a `WindowUpdate`, or `None` if the payload is
    /// not exactly four bytes.
    pub fn window_increment(&self) -> Option<u32> {
        if self.frame_type != FrameType::WindowUpdate {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Cancel reason, if the payload carries one.
    pub fn cancel_reason(&self) -> Option<String> {
        if self.frame_type != FrameType::Cancel || self.payload.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.payload).into_owned())
    }
}
