//! Stream handles.

use std::sync::Arc;

use apitunnel_proto::{Frame, FrameType, RequestHead, ResponseHead};
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Fate, Outcome, Shared, StreamState, credit_cost, outcome_of};
use crate::error::{Result, TunnelError};

/// The receiving end of one stream.
///
/// Dropping a stream that has not finished cancels it and sends a
/// `Cancel` frame to the peer.
///
/// Body chunks the peer sends count against this stream's window until
/// they are read here; reading hands the credit back in batches of half a
/// window.
pub struct TunnelStream {
    id: u64,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    fate: Fate,
    done: bool,
    /// Credit consumed by reads and not yet granted back.
    consumed: usize,
}

impl TunnelStream {
    pub(crate) const fn new(
        id: u64,
        shared: Arc<Shared>,
        inbound: mpsc::UnboundedReceiver<Frame>,
        fate: Fate,
    ) -> Self {
        Self {
            id,
            shared,
            inbound,
            fate,
            done: false,
            consumed: 0,
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state, or `None` once the stream has left the session.
    pub fn state(&self) -> Option<StreamState> {
        self.shared.stream_state(self.id)
    }

    /// A cloneable handle for sending frames on this stream.
    pub fn sender(&self) -> StreamSender {
        StreamSender {
            id: self.id,
            shared: Arc::clone(&self.shared),
            fate: Arc::clone(&self.fate),
        }
    }

    /// Next frame from the peer.
    ///
    /// Yields header, body, and end frames. Returns `Ok(None)` after the
    /// stream completed, and an error if it was cancelled, failed by the
    /// peer, timed out, or lost with its session.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return self.settled();
        }
        match self.inbound.recv().await {
            Some(frame) => match frame.frame_type {
                FrameType::Cancel | FrameType::Error => {
                    self.done = true;
                    match outcome_of(&frame) {
                        Outcome::Failed(e) => Err(e),
                        Outcome::Completed => Ok(None),
                    }
                }
                FrameType::ResponseEnd => {
                    self.done = true;
                    Ok(Some(frame))
                }
                kind if kind.is_body() => {
                    self.release_credit(frame.payload.len());
                    Ok(Some(frame))
                }
                _ => Ok(Some(frame)),
            },
            None => {
                self.done = true;
                self.settled()
            }
        }
    }

    fn release_credit(&mut self, len: usize) {
        self.consumed += credit_cost(len);
        if self.consumed >= self.shared.window() / 2 {
            self.shared.grant(self.id, self.consumed);
            self.consumed = 0;
        }
    }

    fn settled(&self) -> Result<Option<Frame>> {
        match self.fate.get() {
            Some(Outcome::Completed) => Ok(None),
            Some(Outcome::Failed(e)) => Err(e.clone()),
            None => Err(TunnelError::SessionClosed(format!(
                "stream {} released without an outcome",
                self.id
            ))),
        }
    }

    /// Cancel the stream and notify the peer.
    pub fn cancel(self, reason: &str) {
        self.shared.cancel_stream(self.id, reason);
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.shared
            .cancel_stream(self.id, "stream abandoned by local endpoint");
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Sending half of a stream. Every frame passes the stream state machine
/// before it is queued; frames it would reject are refused locally.
#[derive(Clone)]
pub struct StreamSender {
    id: u64,
    shared: Arc<Shared>,
    fate: Fate,
}

impl StreamSender {
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn max_payload(&self) -> usize {
        self.shared.max_payload()
    }

    pub async fn send(&self, frame_type: FrameType, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        let max = self.shared.max_payload();
        if payload.len() > max {
            return Err(TunnelError::Protocol(format!(
                "{frame_type} payload of {} bytes exceeds the {max} byte frame limit",
                payload.len()
            )));
        }
        self.shared
            .send_frame(Frame::new(self.id, frame_type, payload), &self.fate)
            .await
    }

    /// Send `data` as one or more body chunks within the frame limit.
    /// Empty data sends nothing.
    pub async fn send_body(&self, frame_type: FrameType, mut data: Bytes) -> Result<()> {
        let max = self.shared.max_payload();
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(max));
            self.send(frame_type, chunk).await?;
        }
        Ok(())
    }

    pub async fn send_request_head(&self, head: &RequestHead) -> Result<()> {
        self.send(FrameType::RequestHeader, head.to_payload()?).await
    }

    pub async fn send_response_head(&self, head: &ResponseHead) -> Result<()> {
        self.send(FrameType::ResponseHeader, head.to_payload()?)
            .await
    }

    /// Send an empty end-of-direction frame.
    pub async fn finish(&self, frame_type: FrameType) -> Result<()> {
        self.send(frame_type, Bytes::new()).await
    }

    /// Fail the stream with an `Error` frame describing `error`.
    pub async fn fail(&self, error: &TunnelError) -> Result<()> {
        self.send(FrameType::Error, error.to_fault().to_payload()?)
            .await
    }

    pub fn cancel(&self, reason: &str) {
        self.shared.cancel_stream(self.id, reason);
    }
}

impl std::fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Streams opened by the peer, in arrival order.
pub struct IncomingStreams {
    rx: mpsc::Receiver<TunnelStream>,
}

impl IncomingStreams {
    pub(crate) const fn new(rx: mpsc::Receiver<TunnelStream>) -> Self {
        Self { rx }
    }

    /// Next peer-opened stream. `None` once the session has ended.
    pub async fn accept(&mut self) -> Option<TunnelStream> {
        self.rx.recv().await
    }
}
