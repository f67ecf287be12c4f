//! Bridge listener: every inbound HTTP request becomes one tunnel stream.

use std::time::Instant;

use apitunnel_core::{StreamSender, TunnelError, TunnelStream};
use apitunnel_proto::{FrameType, RequestHead, ResponseHead, is_hop_by_hop};
use axum::Router;
use axum::body::{Body, HttpBody};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::registry::SessionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct BridgeState {
    pub sessions: SessionRegistry,
}

/// Every path and method is forwarded.
pub fn build_router(state: BridgeState) -> Router {
    Router::new()
        .fallback(forward)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Status code a client sees for a failed stream.
pub const fn status_for(err: &TunnelError) -> StatusCode {
    match err {
        TunnelError::TargetTimeout(_) | TunnelError::StreamTimeout(_) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, [("content-type", "text/plain; charset=utf-8")], format!("{message}\n")).into_response()
}

fn failed(err: &TunnelError) -> Response {
    let status = status_for(err);
    warn!(status = status.as_u16(), error = %err, "Request failed in tunnel");
    error_response(status, &err.to_string())
}

/// Forward one request through the active session.
async fn forward(State(state): State<BridgeState>, req: Request) -> Response {
    let Some(session) = state.sessions.current().await else {
        debug!(method = %req.method(), uri = %req.uri(), "No tunnel connected");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Tunnel connection not available");
    };
    let started = Instant::now();

    let (parts, body) = req.into_parts();
    let head = RequestHead {
        method: parts.method.to_string(),
        uri: parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), ToString::to_string),
        headers: end_to_end_headers(&parts.headers),
        has_body: !body.is_end_stream(),
    };

    let mut stream = match session.open_stream(&head).await {
        Ok(stream) => stream,
        Err(e) => return failed(&e),
    };
    let stream_id = stream.id();
    debug!(session = %session.id(), stream = stream_id, method = %head.method, uri = %head.uri, "Forwarding request");

    tokio::spawn(pump_request_body(body, stream.sender()));

    let header = match stream.recv().await {
        Ok(Some(frame)) if frame.frame_type == FrameType::ResponseHeader => frame,
        Ok(_) => {
            return failed(&TunnelError::Protocol(format!(
                "stream {stream_id} ended without a response header"
            )));
        }
        Err(e) => return failed(&e),
    };
    let response_head = match ResponseHead::from_payload(&header.payload) {
        Ok(head) => head,
        Err(e) => {
            stream.cancel("unreadable response header");
            return failed(&e.into());
        }
    };

    let Ok(status) = StatusCode::from_u16(response_head.status) else {
        stream.cancel("invalid response status");
        return failed(&TunnelError::Protocol(format!(
            "invalid status {} from offramp",
            response_head.status
        )));
    };
    debug!(
        stream = stream_id,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis(),
        "Response header received"
    );

    let mut response = Response::new(response_body(stream));
    *response.status_mut() = status;
    copy_headers(&response_head.headers, response.headers_mut());
    response
}

/// Request headers to forward, in order, minus hop-by-hop ones.
fn end_to_end_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                debug!(header = %name, "Skipping non-text header value");
                None
            }
        })
        .collect();
    apitunnel_proto::strip_hop_by_hop(&mut out);
    out
}

fn copy_headers(from: &[(String, String)], to: &mut HeaderMap) {
    for (name, value) in from {
        if is_hop_by_hop(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                to.append(name, value);
            }
            _ => debug!(header = %name, "Dropping invalid response header"),
        }
    }
}

/// Copy the client's body into the stream, then mark the request ended.
async fn pump_request_body(body: Body, tx: StreamSender) {
    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        match chunk {
            Ok(bytes) => {
                if let Err(e) = tx.send_body(FrameType::RequestBodyChunk, bytes).await {
                    debug!(stream = tx.id(), error = %e, "Stopped forwarding request body");
                    return;
                }
            }
            Err(e) => {
                warn!(stream = tx.id(), error = %e, "Client request body failed");
                tx.cancel("client request body aborted");
                return;
            }
        }
    }
    if let Err(e) = tx.finish(FrameType::RequestEnd).await {
        debug!(stream = tx.id(), error = %e, "Could not end request");
    }
}

/// Stream response chunks to the client as they arrive. Dropping the
/// body (client gone) drops the stream, which cancels it on the Offramp.
fn response_body(mut stream: TunnelStream) -> Body {
    Body::from_stream(async_stream::stream! {
        loop {
            match stream.recv().await {
                Ok(Some(frame)) if frame.frame_type == FrameType::ResponseBodyChunk => {
                    yield Ok::<_, TunnelError>(frame.payload);
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(stream = stream.id(), error = %e, "Response body interrupted");
                    yield Err(e);
                    break;
                }
            }
        }
    })
}
