//! Runs one tunnelled request against the target.

use std::sync::Arc;

use apitunnel_core::{StreamSender, TunnelError, TunnelStream};
use apitunnel_proto::{FrameType, RequestHead, ResponseHead};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::TargetError;
use crate::target::TargetClient;
use crate::target::client::response_headers;
use crate::target::health::HealthTracker;

/// Request body chunks buffered between the tunnel and the target.
const BODY_BUFFER: usize = 8;

type BodyFeed = mpsc::Sender<Result<Bytes, std::io::Error>>;

/// Turns incoming streams into target requests.
pub struct StreamDispatcher {
    client: TargetClient,
    health: Arc<HealthTracker>,
}

impl StreamDispatcher {
    pub const fn new(client: TargetClient, health: Arc<HealthTracker>) -> Self {
        Self { client, health }
    }

    /// Serve `stream` to completion. Failures are reported to the peer as
    /// an `Error` frame while the stream is still open.
    pub async fn dispatch(&self, mut stream: TunnelStream) {
        let tx = stream.sender();
        let id = stream.id();
        match self.serve(&mut stream, &tx).await {
            Ok(status) => debug!(stream = id, status, "Stream served"),
            Err(e) => {
                if stream.state().is_some_and(|s| !s.is_terminal()) {
                    warn!(stream = id, error = %e, "Request to target failed");
                    if let Err(send_err) = tx.fail(&e).await {
                        debug!(stream = id, error = %send_err, "Could not report failure");
                    }
                } else {
                    debug!(stream = id, error = %e, "Stream ended before completion");
                }
            }
        }
    }

    async fn serve(&self, stream: &mut TunnelStream, tx: &StreamSender) -> Result<u16, TunnelError> {
        let head = match stream.recv().await? {
            Some(frame) if frame.frame_type == FrameType::RequestHeader => {
                RequestHead::from_payload(&frame.payload)?
            }
            _ => {
                return Err(TunnelError::Protocol(format!(
                    "stream {} did not start with a request header",
                    stream.id()
                )));
            }
        };
        if !self.health.is_healthy() {
            return Err(TunnelError::TargetUnavailable(
                "target is marked unhealthy".into(),
            ));
        }
        debug!(stream = stream.id(), method = %head.method, uri = %head.uri, "Dispatching to target");

        let mut request = RequestPump::new(&head);
        let call = self.client.send(&head, request.body.take());
        tokio::pin!(call);

        let response = loop {
            tokio::select! {
                result = &mut call => break result.map_err(TunnelError::from)?,
                () = request.step(stream) => request.check()?,
            }
        };
        // The response header may only follow the end of the request.
        request.drain(stream).await?;

        let status = response.status().as_u16();
        tx.send_response_head(&ResponseHead {
            status,
            headers: response_headers(response.headers()),
        })
        .await?;

        let mut body = response.bytes_stream();
        let mut peer_open = true;
        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => tx.send_body(FrameType::ResponseBodyChunk, bytes).await?,
                    Some(Err(e)) => {
                        return Err(TargetError::Http(format!("response body: {e}")).into());
                    }
                    None => break,
                },
                frame = stream.recv(), if peer_open => match frame? {
                    Some(frame) => {
                        return Err(TunnelError::Protocol(format!(
                            "unexpected {} while streaming response",
                            frame.frame_type
                        )));
                    }
                    None => peer_open = false,
                },
            }
        }
        tx.finish(FrameType::ResponseEnd).await?;
        Ok(status)
    }
}

/// Moves request body frames from the stream into the target request
/// while watching the stream for cancellation.
struct RequestPump {
    body: Option<reqwest::Body>,
    feed: Option<BodyFeed>,
    pending: Option<Bytes>,
    ended: bool,
    peer_open: bool,
    fault: Option<TunnelError>,
}

impl RequestPump {
    fn new(head: &RequestHead) -> Self {
        let (body, feed) = if head.has_body {
            let (feed, rx) = mpsc::channel(BODY_BUFFER);
            (
                Some(reqwest::Body::wrap_stream(ReceiverStream::new(rx))),
                Some(feed),
            )
        } else {
            (None, None)
        };
        Self {
            body,
            feed,
            pending: None,
            ended: false,
            peer_open: true,
            fault: None,
        }
    }

    /// Make one unit of progress. Never completes once nothing is left to
    /// do, so it can sit in a `select!` beside the target call.
    async fn step(&mut self, stream: &mut TunnelStream) {
        if self.fault.is_some() {
            return std::future::pending().await;
        }
        if let Some(chunk) = self.pending.take() {
            let delivered = match &self.feed {
                Some(feed) => match feed.reserve().await {
                    Ok(permit) => {
                        permit.send(Ok(chunk));
                        true
                    }
                    Err(_) => false,
                },
                None => false,
            };
            if !delivered {
                // Target stopped reading the body; keep consuming frames.
                self.feed = None;
            }
            return;
        }
        if !self.peer_open {
            return std::future::pending().await;
        }
        match stream.recv().await {
            Ok(Some(frame)) => self.accept(frame.frame_type, frame.payload),
            Ok(None) => self.peer_open = false,
            Err(e) => self.fault = Some(e),
        }
    }

    fn accept(&mut self, frame_type: FrameType, payload: Bytes) {
        match frame_type {
            FrameType::RequestBodyChunk if !self.ended => {
                if self.feed.is_some() {
                    self.pending = Some(payload);
                }
            }
            FrameType::RequestEnd if !self.ended => {
                self.ended = true;
                self.feed = None;
            }
            other => {
                self.fault = Some(TunnelError::Protocol(format!(
                    "unexpected {other} while forwarding request"
                )));
            }
        }
    }

    fn check(&mut self) -> Result<(), TunnelError> {
        self.fault.take().map_or(Ok(()), Err)
    }

    /// Consume the rest of the request after the target has answered.
    async fn drain(&mut self, stream: &mut TunnelStream) -> Result<(), TunnelError> {
        self.feed = None;
        self.pending = None;
        while !self.ended && self.peer_open {
            self.step(stream).await;
            self.check()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use apitunnel_core::{SessionOptions, test_session_pair};
    use axum::Router;
    use axum::routing::{get, post};
    use tokio::net::TcpListener;

    use super::*;
    use crate::target::TargetConfig;

    async fn spawn_target(app: Router) -> TargetConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        TargetConfig::new("127.0.0.1", port)
    }

    fn target_app() -> Router {
        Router::new()
            .route("/echo", post(|body: Bytes| async move { body }))
            .route("/hello", get(|| async { ([("x-target", "yes")], "hello") }))
            .route(
                "/stall",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late"
                }),
            )
            .route(
                "/early",
                post(|| async { (axum::http::StatusCode::PAYLOAD_TOO_LARGE, "nope") }),
            )
    }

    fn dispatcher_for(config: &TargetConfig, health: Arc<HealthTracker>) -> Arc<StreamDispatcher> {
        Arc::new(StreamDispatcher::new(
            TargetClient::new(config).unwrap(),
            health,
        ))
    }

    fn request(method: &str, uri: &str, has_body: bool) -> RequestHead {
        RequestHead {
            method: method.into(),
            uri: uri.into(),
            headers: vec![("host".into(), "public.example".into())],
            has_body,
        }
    }

    async fn read_response(stream: &mut TunnelStream) -> Result<(ResponseHead, Vec<u8>), TunnelError> {
        let frame = stream.recv().await?.unwrap();
        assert_eq!(frame.frame_type, FrameType::ResponseHeader);
        let head = ResponseHead::from_payload(&frame.payload).unwrap();
        let mut body = Vec::new();
        while let Some(frame) = stream.recv().await? {
            match frame.frame_type {
                FrameType::ResponseBodyChunk => body.extend_from_slice(&frame.payload),
                FrameType::ResponseEnd => break,
                other => panic!("unexpected {other}"),
            }
        }
        Ok((head, body))
    }

    #[tokio::test]
    async fn bodyless_request_round_trips() {
        let config = spawn_target(target_app()).await;
        let dispatcher = dispatcher_for(&config, Arc::new(HealthTracker::new(1)));
        let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
            .await
            .unwrap();
        tokio::spawn(async move {
            while let Some(stream) = incoming.accept().await {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.dispatch(stream).await });
            }
        });

        let mut stream = bridge.open_stream(&request("GET", "/hello", false)).await.unwrap();
        stream.sender().finish(FrameType::RequestEnd).await.unwrap();
        let (head, body) = read_response(&mut stream).await.unwrap();
        assert_eq!(head.status, 200);
        assert!(head.headers.iter().any(|(n, v)| n == "x-target" && v == "yes"));
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn large_body_is_byte_identical() {
        let config = spawn_target(target_app()).await;
        let dispatcher = dispatcher_for(&config, Arc::new(HealthTracker::new(1)));
        let options = SessionOptions {
            max_payload: 1024,
            ..SessionOptions::default()
        };
        let (bridge, _offramp, mut incoming) = test_session_pair(options).await.unwrap();
        tokio::spawn(async move {
            let stream = incoming.accept().await.unwrap();
            dispatcher.dispatch(stream).await;
        });

        let payload: Vec<u8> = (0..200_000u32)
            .map(|i| u8::try_from(i.wrapping_mul(31) % 251).unwrap())
            .collect();
        let mut stream = bridge.open_stream(&request("POST", "/echo", true)).await.unwrap();
        let tx = stream.sender();
        let to_send = Bytes::from(payload.clone());
        tokio::spawn(async move {
            tx.send_body(FrameType::RequestBodyChunk, to_send).await.unwrap();
            tx.finish(FrameType::RequestEnd).await.unwrap();
        });

        let (head, body) = read_response(&mut stream).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(body.len(), payload.len());
        assert!(body == payload);
    }

    #[tokio::test]
    async fn unhealthy_target_fails_fast() {
        let config = spawn_target(target_app()).await;
        let health = Arc::new(HealthTracker::new(1));
        health.record(false);
        let dispatcher = dispatcher_for(&config, health);
        let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
            .await
            .unwrap();
        tokio::spawn(async move {
            let stream = incoming.accept().await.unwrap();
            dispatcher.dispatch(stream).await;
        });

        let mut stream = bridge.open_stream(&request("GET", "/hello", false)).await.unwrap();
        stream.sender().finish(FrameType::RequestEnd).await.unwrap();
        let started = std::time::Instant::now();
        let err = stream.recv().await.unwrap_err();
        assert!(matches!(err, TunnelError::TargetUnavailable(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unreachable_target_reports_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let dispatcher =
            dispatcher_for(&TargetConfig::new("127.0.0.1", port), Arc::new(HealthTracker::new(1)));
        let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
            .await
            .unwrap();
        tokio::spawn(async move {
            let stream = incoming.accept().await.unwrap();
            dispatcher.dispatch(stream).await;
        });

        let mut stream = bridge.open_stream(&request("GET", "/", false)).await.unwrap();
        stream.sender().finish(FrameType::RequestEnd).await.unwrap();
        assert!(matches!(
            stream.recv().await,
            Err(TunnelError::TargetUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn slow_target_reports_timeout() {
        let mut config = spawn_target(target_app()).await;
        config.response_timeout = Duration::from_millis(100);
        let dispatcher = dispatcher_for(&config, Arc::new(HealthTracker::new(1)));
        let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
            .await
            .unwrap();
        tokio::spawn(async move {
            let stream = incoming.accept().await.unwrap();
            dispatcher.dispatch(stream).await;
        });

        let mut stream = bridge.open_stream(&request("GET", "/stall", false)).await.unwrap();
        stream.sender().finish(FrameType::RequestEnd).await.unwrap();
        assert!(matches!(
            stream.recv().await,
            Err(TunnelError::TargetTimeout(_))
        ));
    }

    #[tokio::test]
    async fn cancel_aborts_pending_target_call() {
        let config = spawn_target(target_app()).await;
        let dispatcher = dispatcher_for(&config, Arc::new(HealthTracker::new(1)));
        let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
            .await
            .unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let stream = incoming.accept().await.unwrap();
            dispatcher.dispatch(stream).await;
            let _ = done_tx.send(());
        });

        let stream = bridge.open_stream(&request("GET", "/stall", false)).await.unwrap();
        stream.sender().finish(FrameType::RequestEnd).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.cancel("client went away");

        tokio::time::timeout(Duration::from_secs(2), done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn early_response_waits_for_request_end() {
        let config = spawn_target(target_app()).await;
        let dispatcher = dispatcher_for(&config, Arc::new(HealthTracker::new(1)));
        let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
            .await
            .unwrap();
        tokio::spawn(async move {
            let stream = incoming.accept().await.unwrap();
            dispatcher.dispatch(stream).await;
        });

        let mut stream = bridge.open_stream(&request("POST", "/early", true)).await.unwrap();
        let tx = stream.sender();
        tx.send_body(FrameType::RequestBodyChunk, Bytes::from_static(b"part one"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send_body(FrameType::RequestBodyChunk, Bytes::from_static(b"part two"))
            .await
            .unwrap();
        tx.finish(FrameType::RequestEnd).await.unwrap();

        let (head, body) = read_response(&mut stream).await.unwrap();
        assert_eq!(head.status, 413);
        assert_eq!(body, b"nope");
    }

    #[test]
    fn unexpected_frame_is_protocol_fault() {
        let mut pump = RequestPump::new(&request("GET", "/", false));
        pump.accept(FrameType::ResponseHeader, Bytes::new());
        assert!(matches!(pump.check(), Err(TunnelError::Protocol(_))));
        assert!(pump.check().is_ok());
    }
}
