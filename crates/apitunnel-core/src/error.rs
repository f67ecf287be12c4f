//! Error types for the tunnel.

use apitunnel_proto::{CodecError, ErrorCode, MessageError, StreamFault};
use thiserror::Error;

/// Result type alias using `TunnelError`.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Tunnel error taxonomy.
///
/// Session-scoped kinds (`Authentication`, `Transport`, `Protocol`,
/// `SessionClosed`) end the connection they occurred on. Stream-scoped
/// kinds end one request and leave the session running.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// Bad or missing proof, or the handshake timed out.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Reset, EOF, or broken pipe on the physical connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame, oversized payload, unknown correlation ID, or an
    /// illegal frame sequence.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Target refused the connection or is marked unhealthy.
    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    /// Target accepted the request but did not respond in time.
    #[error("Target timed out: {0}")]
    TargetTimeout(String),

    /// No frame moved on the stream within the idle bound.
    #[error("Stream timed out: {0}")]
    StreamTimeout(String),

    /// The stream was cancelled by either endpoint.
    #[error("Stream cancelled: {0}")]
    Cancelled(String),

    /// The peer failed the stream for a reason it did not classify.
    #[error("Remote stream failure: {0}")]
    Remote(String),

    /// The session was shut down while the operation was pending.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Invalid settings.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TunnelError {
    /// Whether this error means the connection can no longer be used.
    pub const fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Transport(_) | Self::Protocol(_) | Self::SessionClosed(_)
        )
    }

    /// Whether a fresh connection attempt may succeed where this one failed.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    /// Map an `Error` frame payload received from the peer.
    pub fn from_fault(fault: StreamFault) -> Self {
        match fault.code {
            ErrorCode::TargetUnavailable => Self::TargetUnavailable(fault.message),
            ErrorCode::TargetTimeout => Self::TargetTimeout(fault.message),
            ErrorCode::StreamTimeout => Self::StreamTimeout(fault.message),
            ErrorCode::Protocol | ErrorCode::Internal => Self::Remote(fault.message),
        }
    }

    /// The `Error` frame payload describing this error to the peer.
    pub fn to_fault(&self) -> StreamFault {
        let code = match self {
            Self::TargetUnavailable(_) => ErrorCode::TargetUnavailable,
            Self::TargetTimeout(_) => ErrorCode::TargetTimeout,
            Self::StreamTimeout(_) => ErrorCode::StreamTimeout,
            Self::Protocol(_) => ErrorCode::Protocol,
            _ => ErrorCode::Internal,
        };
        StreamFault::new(code, self.to_string())
    }
}

impl From<CodecError> for TunnelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => Self::Transport(io.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<MessageError> for TunnelError {
    fn from(e: MessageError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
