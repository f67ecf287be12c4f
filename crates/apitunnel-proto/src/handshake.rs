//! PSK handshake wire constants.
//!
//! The connecting side writes a fixed-length proof as the first bytes on
//! the connection; the accepting side answers with one status byte. A
//! nonzero status is followed by connection close.

/// Length of the PSK proof in bytes.
pub const PROOF_LEN: usize = 32;

/// Status byte sent when the proof matched.
pub const STATUS_ACCEPTED: u8 = 0;

/// Status byte sent before closing on a mismatched proof.
pub const STATUS_REJECTED: u8 = 1;
