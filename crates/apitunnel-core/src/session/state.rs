//! Per-stream lifecycle.
//!
//! Both endpoints run the same machine over every frame of a stream, in
//! whichever direction the frame travels. A frame the current state does
//! not allow is a protocol violation.

use apitunnel_proto::FrameType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    HeaderSent,
    BodyStreaming,
    AwaitingPeer,
    RemoteHeaderReceived,
    ResponseStreaming,
    Complete,
    Cancelled,
    Error,
}

/// A frame arrived (or was about to be sent) in a state that forbids it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{frame} not allowed in state {from:?}")]
pub struct IllegalTransition {
    pub from: StreamState,
    pub frame: FrameType,
}

impl StreamState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Error)
    }

    /// The state after `frame`. Terminal states accept nothing.
    pub const fn advance(self, frame: FrameType) -> Result<Self, IllegalTransition> {
        use FrameType as F;
        let next = match (self, frame) {
            (s, _) if s.is_terminal() => None,
            (_, F::Cancel) => Some(Self::Cancelled),
            (_, F::Error) => Some(Self::Error),
            (Self::Created, F::RequestHeader) => Some(Self::HeaderSent),
            (Self::HeaderSent | Self::BodyStreaming, F::RequestBodyChunk) => {
                Some(Self::BodyStreaming)
            }
            (Self::HeaderSent | Self::BodyStreaming, F::RequestEnd) => Some(Self::AwaitingPeer),
            (Self::AwaitingPeer, F::ResponseHeader) => Some(Self::RemoteHeaderReceived),
            (Self::RemoteHeaderReceived | Self::ResponseStreaming, F::ResponseBodyChunk) => {
                Some(Self::ResponseStreaming)
            }
            (Self::RemoteHeaderReceived | Self::ResponseStreaming, F::ResponseEnd) => {
                Some(Self::Complete)
            }
            _ => None,
        };
        match next {
            Some(state) => Ok(state),
            None => Err(IllegalTransition { from: self, frame }),
        }
    }
}
