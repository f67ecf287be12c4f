//! Structured payloads carried by header and error frames.
//!
//! Header payloads are JSON. Body chunks are raw bytes and never pass
//! through this module.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed frame payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// HTTP request line and headers, sent as the `RequestHeader` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    /// Path and query as received by the Bridge.
    pub uri: String,
    /// End-to-end headers in arrival order; names may repeat.
    pub headers: Vec<(String, String)>,
    /// Whether `RequestBodyChunk` frames may follow. `false` means the
    /// target must receive an empty body.
    pub has_body: bool,
}

/// HTTP status and headers, sent as the `ResponseHeader` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Why a stream failed, carried in an `Error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Target refused the connection, or the health monitor has it marked down.
    TargetUnavailable,
    /// Target accepted the request but did not answer in time.
    TargetTimeout,
    /// No frame moved on the stream within the idle bound.
    StreamTimeout,
    /// The peer sent something the stream could not interpret.
    Protocol,
    Internal,
}

/// `Error` frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFault {
    pub code: ErrorCode,
    pub message: String,
}

impl StreamFault {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Headers that describe a single HTTP hop and are never forwarded
/// through the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` is hop-by-hop. Case-insensitive.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Drop hop-by-hop headers, including any named by a `Connection` header.
pub fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    let listed: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    headers.retain(|(name, _)| {
        !is_hop_by_hop(name) && !listed.iter().any(|l| l.eq_ignore_ascii_case(name))
    });
}

macro_rules! json_payload {
    ($ty:ty) => {
        impl $ty {
            pub fn to_payload(&self) -> Result<Bytes, MessageError> {
                Ok(Bytes::from(serde_json::to_vec(self)?))
            }

            pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
                Ok(serde_json::from_slice(payload)?)
            }
        }
    };
}

json_payload!(RequestHead);
json_payload!(ResponseHead);
json_payload!(StreamFault);
