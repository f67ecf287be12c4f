use std::time::Duration;

use apitunnel_crypto::PskCredential;
use apitunnel_proto::{Frame, FrameCodec, FrameType, RequestHead, ResponseHead};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};

use super::*;
use crate::handshake::{present_proof, verify_proof};

const T: Duration = Duration::from_secs(5);

fn head(method: &str, uri: &str, has_body: bool) -> RequestHead {
    RequestHead {
        method: method.into(),
        uri: uri.into(),
        headers: vec![("host".into(), "example.test".into())],
        has_body,
    }
}

fn fast_options() -> SessionOptions {
    SessionOptions {
        idle_timeout: Duration::from_millis(150),
        ..SessionOptions::default()
    }
}

/// Responder session driven by a hand-written peer speaking raw frames.
struct RawPeer {
    frames: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    async fn send(&mut self, frame: Frame) {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        self.writer.write_all(&buf).await.unwrap();
    }

    async fn next(&mut self) -> Frame {
        tokio::time::timeout(T, self.frames.next())
            .await
            .expect("frame within timeout")
            .expect("connection open")
            .unwrap()
    }
}

async fn raw_responder(options: SessionOptions) -> (TunnelSession, IncomingStreams, RawPeer) {
    let psk = PskCredential::new("raw-peer").unwrap();
    let (client, server) = tokio::io::duplex(256 * 1024);
    let (client, server) = tokio::join!(
        present_proof(client, &psk, T),
        verify_proof(server, &psk, T)
    );
    let (session, incoming) = TunnelSession::responder(server.unwrap(), options);
    let (reader, writer) = tokio::io::split(client.unwrap().into_inner());
    let peer = RawPeer {
        frames: FramedRead::new(reader, FrameCodec::default()),
        writer,
    };
    (session, incoming, peer)
}

async fn collect_body(stream: &mut TunnelStream, chunk: FrameType, end: FrameType) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let frame = stream.recv().await.unwrap().expect("frame before end");
        if frame.frame_type == end {
            return body;
        }
        assert_eq!(frame.frame_type, chunk);
        body.extend_from_slice(&frame.payload);
    }
}

#[tokio::test]
async fn request_and_response_flow_end_to_end() {
    let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
        .await
        .unwrap();

    let mut stream = bridge.open_stream(&head("POST", "/echo", true)).await.unwrap();
    let tx = stream.sender();
    tx.send_body(FrameType::RequestBodyChunk, Bytes::from_static(b"hello "))
        .await
        .unwrap();
    tx.send_body(FrameType::RequestBodyChunk, Bytes::from_static(b"world"))
        .await
        .unwrap();
    tx.finish(FrameType::RequestEnd).await.unwrap();

    let mut remote = incoming.accept().await.unwrap();
    let header = remote.recv().await.unwrap().unwrap();
    assert_eq!(header.frame_type, FrameType::RequestHeader);
    assert_eq!(
        RequestHead::from_payload(&header.payload).unwrap().uri,
        "/echo"
    );
    let body = collect_body(
        &mut remote,
        FrameType::RequestBodyChunk,
        FrameType::RequestEnd,
    )
    .await;
    assert_eq!(body, b"hello world");

    let rtx = remote.sender();
    rtx.send_response_head(&ResponseHead {
        status: 201,
        headers: vec![],
    })
    .await
    .unwrap();
    rtx.send_body(FrameType::ResponseBodyChunk, Bytes::from(body))
        .await
        .unwrap();
    rtx.finish(FrameType::ResponseEnd).await.unwrap();

    let header = stream.recv().await.unwrap().unwrap();
    assert_eq!(
        ResponseHead::from_payload(&header.payload).unwrap().status,
        201
    );
    let echoed = collect_body(
        &mut stream,
        FrameType::ResponseBodyChunk,
        FrameType::ResponseEnd,
    )
    .await;
    assert_eq!(echoed, b"hello world");
    assert!(stream.recv().await.unwrap().is_none());
    assert_eq!(bridge.active_streams(), 0);
}

#[tokio::test]
async fn correlation_ids_start_at_one_and_increase() {
    let (bridge, _offramp, _incoming) = test_session_pair(SessionOptions::default())
        .await
        .unwrap();
    let a = bridge.open_stream(&head("GET", "/a", false)).await.unwrap();
    let b = bridge.open_stream(&head("GET", "/b", false)).await.unwrap();
    let c = bridge.open_stream(&head("GET", "/c", false)).await.unwrap();
    assert_eq!((a.id(), b.id(), c.id()), (1, 2, 3));
    assert_eq!(bridge.active_streams(), 3);
}

#[tokio::test]
async fn concurrent_streams_do_not_cross() {
    let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
        .await
        .unwrap();

    // Echo the request body back with the URI prepended.
    tokio::spawn(async move {
        while let Some(mut remote) = incoming.accept().await {
            tokio::spawn(async move {
                let header = remote.recv().await.unwrap().unwrap();
                let uri = RequestHead::from_payload(&header.payload).unwrap().uri;
                let body = collect_body(
                    &mut remote,
                    FrameType::RequestBodyChunk,
                    FrameType::RequestEnd,
                )
                .await;
                let tx = remote.sender();
                tx.send_response_head(&ResponseHead {
                    status: 200,
                    headers: vec![],
                })
                .await
                .unwrap();
                let mut reply = uri.into_bytes();
                reply.extend_from_slice(&body);
                tx.send_body(FrameType::ResponseBodyChunk, Bytes::from(reply))
                    .await
                    .unwrap();
                tx.finish(FrameType::ResponseEnd).await.unwrap();
            });
        }
    });

    let mut tasks = Vec::new();
    for i in 0..32usize {
        let bridge = bridge.clone();
        tasks.push(tokio::spawn(async move {
            let uri = format!("/item/{i}");
            let payload = format!(":{}", "x".repeat(i * 100));
            let mut stream = bridge.open_stream(&head("PUT", &uri, true)).await.unwrap();
            let tx = stream.sender();
            tx.send_body(FrameType::RequestBodyChunk, Bytes::from(payload.clone()))
                .await
                .unwrap();
            tx.finish(FrameType::RequestEnd).await.unwrap();
            let _ = stream.recv().await.unwrap().unwrap();
            let reply = collect_body(
                &mut stream,
                FrameType::ResponseBodyChunk,
                FrameType::ResponseEnd,
            )
            .await;
            assert_eq!(reply, format!("{uri}{payload}").into_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(bridge.active_streams(), 0);
}

#[tokio::test]
async fn large_body_is_split_at_frame_limit() {
    let options = SessionOptions {
        max_payload: 16,
        ..SessionOptions::default()
    };
    let (bridge, _offramp, _incoming) = test_session_pair(options).await.unwrap();
    let stream = bridge.open_stream(&head("POST", "/", true)).await;
    // A 16-byte limit is too small for the JSON request header.
    assert!(matches!(stream, Err(TunnelError::Protocol(_))));

    let options = SessionOptions {
        max_payload: 128,
        ..SessionOptions::default()
    };
    let (bridge, _offramp, mut incoming2) = test_session_pair(options).await.unwrap();
    let stream = bridge.open_stream(&head("POST", "/", true)).await.unwrap();
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    stream
        .sender()
        .send_body(FrameType::RequestBodyChunk, Bytes::from(data.clone()))
        .await
        .unwrap();
    stream.sender().finish(FrameType::RequestEnd).await.unwrap();

    let mut remote = incoming2.accept().await.unwrap();
    let _ = remote.recv().await.unwrap();
    let mut chunks = 0;
    let mut body = Vec::new();
    loop {
        let frame = remote.recv().await.unwrap().unwrap();
        if frame.frame_type == FrameType::RequestEnd {
            break;
        }
        assert!(frame.payload.len() <= 128);
        chunks += 1;
        body.extend_from_slice(&frame.payload);
    }
    assert_eq!(body, data);
    assert_eq!(chunks, 8);
}

#[tokio::test]
async fn dropping_a_stream_cancels_it_on_the_peer() {
    let (bridge, _offramp, mut incoming) = test_session_pair(SessionOptions::default())
        .await
        .unwrap();
    let stream = bridge.open_stream(&head("GET", "/slow", false)).await.unwrap();
    stream.sender().finish(FrameType::RequestEnd).await.unwrap();

    let mut remote = incoming.accept().await.unwrap();
    let _ = remote.recv().await.unwrap();
    let _ = remote.recv().await.unwrap();
    drop(stream);

    let err = tokio::time::timeout(T, remote.recv()).await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::Cancelled(_)), "{err}");
    assert!(
        remote
            .sender()
            .send_response_head(&ResponseHead {
                status: 200,
                headers: vec![]
            })
            .await
            .is_err()
    );
    assert!(!bridge.is_closed());
}

#[tokio::test]
async fn idle_stream_times_out_without_closing_session() {
    let (bridge, offramp, mut incoming) = test_session_pair(fast_options()).await.unwrap();
    let mut stream = bridge.open_stream(&head("GET", "/never", false)).await.unwrap();
    stream.sender().finish(FrameType::RequestEnd).await.unwrap();
    let _remote = incoming.accept().await.unwrap();

    let err = tokio::time::timeout(T, stream.recv()).await.unwrap().unwrap_err();
    assert!(
        matches!(err, TunnelError::StreamTimeout(_) | TunnelError::Cancelled(_)),
        "{err}"
    );
    assert!(!bridge.is_closed());
    assert!(!offramp.is_closed());
    assert_eq!(bridge.active_streams(), 0);
}

#[tokio::test]
async fn closing_session_fails_open_streams_and_reaches_peer() {
    let (bridge, offramp, _incoming) = test_session_pair(SessionOptions::default())
        .await
        .unwrap();
    let mut stream = bridge.open_stream(&head("GET", "/", false)).await.unwrap();

    bridge.close("shutting down");
    let err = stream.recv().await.unwrap_err();
    assert!(matches!(err, TunnelError::SessionClosed(_)), "{err}");
    assert!(bridge.is_closed());
    assert_eq!(bridge.auth_state(), AuthState::Closed);
    assert!(matches!(
        bridge.close_reason(),
        Some(TunnelError::SessionClosed(_))
    ));
    assert!(bridge.open_stream(&head("GET", "/", false)).await.is_err());

    tokio::time::timeout(T, offramp.closed()).await.unwrap();
    assert!(matches!(
        offramp.close_reason(),
        Some(TunnelError::Transport(_))
    ));
}

#[tokio::test]
async fn local_sequence_violation_is_refused_without_teardown() {
    let (bridge, _offramp, _incoming) = test_session_pair(SessionOptions::default())
        .await
        .unwrap();
    let stream = bridge.open_stream(&head("GET", "/", false)).await.unwrap();
    let tx = stream.sender();
    tx.finish(FrameType::RequestEnd).await.unwrap();
    let err = tx
        .send(FrameType::RequestBodyChunk, Bytes::from_static(b"late"))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Protocol(_)));
    assert!(!bridge.is_closed());
    assert_eq!(stream.state(), Some(StreamState::AwaitingPeer));
}

#[tokio::test]
async fn responder_cannot_open_streams() {
    let (_bridge, offramp, _incoming) = test_session_pair(SessionOptions::default())
        .await
        .unwrap();
    assert!(offramp.open_stream(&head("GET", "/", false)).await.is_err());
}

#[tokio::test]
async fn wrong_direction_frame_tears_down_session() {
    let (session, _incoming, mut peer) = raw_responder(SessionOptions::default()).await;
    peer.send(Frame::empty(1, FrameType::ResponseEnd)).await;

    tokio::time::timeout(T, session.closed()).await.unwrap();
    assert!(matches!(
        session.close_reason(),
        Some(TunnelError::Protocol(_))
    ));
}

#[tokio::test]
async fn unknown_frame_type_tears_down_session() {
    let (session, _incoming, mut peer) = raw_responder(SessionOptions::default()).await;
    let mut raw = vec![0u8; 13];
    raw[7] = 1;
    raw[8] = 42;
    peer.writer.write_all(&raw).await.unwrap();

    tokio::time::timeout(T, session.closed()).await.unwrap();
    assert!(matches!(
        session.close_reason(),
        Some(TunnelError::Protocol(_))
    ));
}

#[tokio::test]
async fn late_frames_for_finished_streams_are_dropped() {
    let (session, mut incoming, mut peer) = raw_responder(SessionOptions::default()).await;
    let req = head("GET", "/", false).to_payload().unwrap();

    peer.send(Frame::new(1, FrameType::RequestHeader, req.clone()))
        .await;
    peer.send(Frame::empty(1, FrameType::RequestEnd)).await;
    let mut remote = incoming.accept().await.unwrap();
    let _ = remote.recv().await.unwrap();
    let _ = remote.recv().await.unwrap();
    let tx = remote.sender();
    tx.send_response_head(&ResponseHead {
        status: 204,
        headers: vec![],
    })
    .await
    .unwrap();
    tx.finish(FrameType::ResponseEnd).await.unwrap();
    assert_eq!(peer.next().await.frame_type, FrameType::ResponseHeader);
    assert_eq!(peer.next().await.frame_type, FrameType::ResponseEnd);

    // Stream 1 is finished; a straggling cancel for it is ignored.
    peer.send(Frame::cancel(1, "late")).await;
    peer.send(Frame::new(2, FrameType::RequestHeader, req)).await;
    let second = tokio::time::timeout(T, incoming.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id(), 2);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn reused_or_unknown_ids_are_protocol_errors() {
    let (session, mut incoming, mut peer) = raw_responder(SessionOptions::default()).await;
    let req = head("GET", "/", false).to_payload().unwrap();
    peer.send(Frame::new(5, FrameType::RequestHeader, req.clone()))
        .await;
    let _stream = incoming.accept().await.unwrap();

    peer.send(Frame::new(3, FrameType::RequestHeader, req)).await;
    tokio::time::timeout(T, session.closed()).await.unwrap();
    assert!(matches!(
        session.close_reason(),
        Some(TunnelError::Protocol(_))
    ));

    let (session, _incoming, mut peer) = raw_responder(SessionOptions::default()).await;
    peer.send(Frame::empty(9, FrameType::RequestEnd)).await;
    tokio::time::timeout(T, session.closed()).await.unwrap();
    assert!(matches!(
        session.close_reason(),
        Some(TunnelError::Protocol(_))
    ));
}

#[tokio::test]
async fn peer_error_frame_surfaces_as_typed_error() {
    let (session, mut incoming, mut peer) = raw_responder(SessionOptions::default()).await;
    let req = head("GET", "/", false).to_payload().unwrap();
    peer.send(Frame::new(1, FrameType::RequestHeader, req)).await;
    let remote = incoming.accept().await.unwrap();

    remote
        .sender()
        .fail(&TunnelError::TargetUnavailable("connection refused".into()))
        .await
        .unwrap();
    let frame = peer.next().await;
    assert_eq!(frame.frame_type, FrameType::Error);
    match outcome_of(&frame) {
        Outcome::Failed(TunnelError::TargetUnavailable(msg)) => {
            assert!(msg.contains("connection refused"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(session.active_streams(), 0);
}

#[tokio::test]
async fn peer_eof_is_transport_loss() {
    let (session, _incoming, peer) = raw_responder(SessionOptions::default()).await;
    drop(peer);
    tokio::time::timeout(T, session.closed()).await.unwrap();
    assert!(matches!(
        session.close_reason(),
        Some(TunnelError::Transport(_))
    ));
}

#[tokio::test]
async fn slow_stream_does_not_stall_other_streams() {
    let options = SessionOptions {
        idle_timeout: Duration::from_secs(2),
        max_payload: 1024,
        stream_window: 4096,
        ..SessionOptions::default()
    };
    let (bridge, _offramp, mut incoming) = test_session_pair(options).await.unwrap();

    let mut slow = bridge.open_stream(&head("GET", "/slow", false)).await.unwrap();
    slow.sender().finish(FrameType::RequestEnd).await.unwrap();
    let mut fast = bridge.open_stream(&head("GET", "/fast", false)).await.unwrap();
    fast.sender().finish(FrameType::RequestEnd).await.unwrap();

    let a = incoming.accept().await.unwrap();
    let b = incoming.accept().await.unwrap();
    let ok = ResponseHead {
        status: 200,
        headers: vec![],
    };

    // Ten chunks on A, far more than its window, with nobody reading A.
    let a_tx = a.sender();
    let a_head = ok.clone();
    let flood = tokio::spawn(async move {
        a_tx.send_response_head(&a_head).await.unwrap();
        for _ in 0..10 {
            a_tx.send(FrameType::ResponseBodyChunk, vec![7u8; 1000])
                .await
                .unwrap();
        }
        a_tx.finish(FrameType::ResponseEnd).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let b_tx = b.sender();
    b_tx.send_response_head(&ok).await.unwrap();
    b_tx.send_body(FrameType::ResponseBodyChunk, Bytes::from_static(b"fast"))
        .await
        .unwrap();
    b_tx.finish(FrameType::ResponseEnd).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_millis(500), async {
        let _ = fast.recv().await.unwrap().unwrap();
        collect_body(&mut fast, FrameType::ResponseBodyChunk, FrameType::ResponseEnd).await
    })
    .await
    .expect("fast stream answered while slow stream is unread");
    assert_eq!(reply, b"fast");
    assert!(!flood.is_finished(), "slow sender should be waiting for credit");

    let _ = slow.recv().await.unwrap().unwrap();
    let body = collect_body(&mut slow, FrameType::ResponseBodyChunk, FrameType::ResponseEnd).await;
    assert_eq!(body.len(), 10_000);
    tokio::time::timeout(T, flood).await.unwrap().unwrap();
    drop((a, b));
    assert!(!bridge.is_closed());
}

#[tokio::test]
async fn full_accept_backlog_refuses_only_the_new_stream() {
    let options = SessionOptions {
        accept_backlog: 1,
        ..SessionOptions::default()
    };
    let (session, mut incoming, mut peer) = raw_responder(options).await;
    let req = head("GET", "/", false).to_payload().unwrap();

    peer.send(Frame::new(1, FrameType::RequestHeader, req.clone()))
        .await;
    peer.send(Frame::new(2, FrameType::RequestHeader, req)).await;

    let refused = peer.next().await;
    assert_eq!(refused.frame_type, FrameType::Cancel);
    assert_eq!(refused.correlation_id, 2);
    assert!(refused.cancel_reason().unwrap().contains("backlog"));

    let first = incoming.accept().await.unwrap();
    assert_eq!(first.id(), 1);
    assert!(!session.is_closed());
    assert_eq!(session.active_streams(), 1);
}

#[tokio::test]
async fn window_overrun_tears_down_session() {
    let options = SessionOptions {
        max_payload: 1024,
        stream_window: 0,
        ..SessionOptions::default()
    };
    let (session, _incoming, mut peer) = raw_responder(options).await;
    let req = head("POST", "/", true).to_payload().unwrap();
    peer.send(Frame::new(1, FrameType::RequestHeader, req)).await;
    // The window floors at two full frames; three chunks exceed it.
    for _ in 0..3 {
        peer.send(Frame::new(1, FrameType::RequestBodyChunk, vec![1u8; 1000]))
            .await;
    }

    tokio::time::timeout(T, session.closed()).await.unwrap();
    assert!(matches!(
        session.close_reason(),
        Some(TunnelError::Protocol(_))
    ));
}

#[tokio::test]
async fn reading_a_body_grants_credit_back() {
    let options = SessionOptions {
        max_payload: 1024,
        stream_window: 0,
        ..SessionOptions::default()
    };
    let (_session, mut incoming, mut peer) = raw_responder(options).await;
    let req = head("POST", "/", true).to_payload().unwrap();
    peer.send(Frame::new(1, FrameType::RequestHeader, req)).await;
    for _ in 0..2 {
        peer.send(Frame::new(1, FrameType::RequestBodyChunk, vec![1u8; 1000]))
            .await;
    }

    let mut remote = incoming.accept().await.unwrap();
    for _ in 0..3 {
        let _ = remote.recv().await.unwrap();
    }

    // Credit goes back once half the window has been read.
    let update = peer.next().await;
    assert_eq!(update.frame_type, FrameType::WindowUpdate);
    assert_eq!(update.correlation_id, 1);
    assert_eq!(update.window_increment(), Some(2 * (1000 + 13)));
}

#[tokio::test]
async fn ping_off_the_session_id_is_a_protocol_error() {
    let (session, _incoming, mut peer) = raw_responder(SessionOptions::default()).await;
    peer.send(Frame::empty(3, FrameType::Ping)).await;
    tokio::time::timeout(T, session.closed()).await.unwrap();
    assert!(matches!(
        session.close_reason(),
        Some(TunnelError::Protocol(_))
    ));
}

fn keepalive_options() -> SessionOptions {
    SessionOptions {
        keepalive_interval: Duration::from_millis(50),
        keepalive_timeout: Duration::from_millis(250),
        ..SessionOptions::default()
    }
}

#[tokio::test]
async fn heartbeat_pings_on_session_id() {
    let (_session, _incoming, mut peer) = raw_responder(keepalive_options()).await;
    let frame = peer.next().await;
    assert_eq!(frame.frame_type, FrameType::Ping);
    assert_eq!(frame.correlation_id, 0);
}

#[tokio::test]
async fn silent_peer_is_detected() {
    // The raw peer never writes, as on a half-open link.
    let (session, _incoming, _peer) = raw_responder(keepalive_options()).await;
    tokio::time::timeout(T, session.closed()).await.unwrap();
    match session.close_reason() {
        Some(TunnelError::Transport(msg)) => assert!(msg.contains("no traffic"), "{msg}"),
        other => panic!("unexpected close reason {other:?}"),
    }
}

#[tokio::test]
async fn pings_keep_an_idle_pair_alive() {
    let (bridge, offramp, _incoming) = test_session_pair(keepalive_options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!bridge.is_closed());
    assert!(!offramp.is_closed());
}
