//! apitunnel wire protocol
//!
//! Everything that crosses the tunnel connection is defined here:
//! - The PSK handshake constants (proof length, status bytes)
//! - `Frame` and `FrameType`, the only unit of post-handshake transfer
//! - `FrameCodec`, a resumable length-prefixed decoder/encoder
//! - Header and error payload messages carried inside frames

pub mod codec;
pub mod frame;
pub mod handshake;
pub mod messages;

pub use codec::{CodecError, FrameCodec, DEFAULT_MAX_PAYLOAD, HEADER_LEN, MAX_PAYLOAD_CEILING};
pub use frame::{Frame, FrameType};
pub use messages::{
    ErrorCode, MessageError, RequestHead, ResponseHead, StreamFault, is_hop_by_hop,
    strip_hop_by_hop,
};
