//! Tunnel sessions.
//!
//! A session owns one authenticated connection and multiplexes any number
//! of request/response streams over it. Each session runs four tasks:
//! a reader routing inbound frames to their stream, a writer draining the
//! outbound queue onto the connection, a sweeper failing streams that
//! have gone idle, and a heartbeat pinging the peer.
//!
//! The reader never waits on a stream consumer. Body chunks are bounded per
//! stream by credit: a sender spends `payload + header` bytes of credit per
//! chunk and the receiver hands it back with `WindowUpdate` frames as its
//! consumer reads. A slow consumer therefore stalls only its own stream.
//!
//! The stream table lock is only ever held for map updates; no await point
//! runs under it.

mod state;
mod stream;

pub use state::{IllegalTransition, StreamState};
pub use stream::{IncomingStreams, StreamSender, TunnelStream};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use apitunnel_proto::{Frame, FrameCodec, FrameType, HEADER_LEN, RequestHead, StreamFault};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TunnelSettings;
use crate::error::{Result, TunnelError};
use crate::handshake::Authenticated;

/// Flush the write buffer once it grows past this many bytes.
const WRITE_BATCH: usize = 256 * 1024;

/// Which side of the tunnel this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens streams and sends request frames (Bridge).
    Initiator,
    /// Accepts streams and sends response frames (Offramp).
    Responder,
}

/// Authentication state of a session. A `TunnelSession` is only ever
/// built from an [`Authenticated`] connection, so it starts out
/// `Authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    Closed,
}

/// Runtime knobs for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub max_payload: usize,
    pub idle_timeout: Duration,
    pub send_queue_capacity: usize,
    pub stream_window: usize,
    pub accept_backlog: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        TunnelSettings::default().session_options()
    }
}

/// How a stream ended, recorded before its channel is dropped so the
/// consumer can tell completion from failure.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Completed,
    Failed(TunnelError),
}

pub(crate) type Fate = Arc<OnceLock<Outcome>>;

/// Outcome carried by a terminal frame.
pub(crate) fn outcome_of(frame: &Frame) -> Outcome {
    match frame.frame_type {
        FrameType::Cancel => Outcome::Failed(TunnelError::Cancelled(
            frame
                .cancel_reason()
                .unwrap_or_else(|| "cancelled by peer".into()),
        )),
        FrameType::Error => Outcome::Failed(match StreamFault::from_payload(&frame.payload) {
            Ok(fault) => TunnelError::from_fault(fault),
            Err(e) => TunnelError::Remote(format!("unreadable error frame: {e}")),
        }),
        _ => Outcome::Completed,
    }
}

/// Credit a body chunk of `len` payload bytes costs.
pub(crate) const fn credit_cost(len: usize) -> usize {
    len + HEADER_LEN
}

struct StreamEntry {
    state: StreamState,
    tx: mpsc::UnboundedSender<Frame>,
    fate: Fate,
    last_activity: Instant,
    /// Bytes we may still send before the peer grants more.
    send_credit: usize,
    /// Bytes the peer has sent that we have not granted back yet.
    recv_used: usize,
    credit: Arc<Notify>,
}

impl StreamEntry {
    /// Wake senders waiting for credit on this stream. The stored permit
    /// covers a sender that has not started waiting yet.
    fn wake(&self) {
        self.credit.notify_waiters();
        self.credit.notify_one();
    }
}

#[derive(Default)]
struct StreamTable {
    entries: HashMap<u64, StreamEntry>,
    /// Highest correlation ID ever admitted on this session.
    high_water: u64,
    closed: bool,
}

enum Route {
    Deliver(mpsc::UnboundedSender<Frame>),
    Open(TunnelStream, mpsc::UnboundedSender<Frame>),
    Control,
    Retired,
}

pub(crate) struct Shared {
    id: Uuid,
    role: Role,
    options: SessionOptions,
    created_at: Instant,
    last_activity_ms: AtomicU64,
    outbound: mpsc::Sender<Frame>,
    table: Mutex<StreamTable>,
    /// Serializes ID assignment with header enqueueing so IDs hit the
    /// wire in increasing order.
    open_gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    close_reason: OnceLock<TunnelError>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        let ms = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) const fn max_payload(&self) -> usize {
        self.options.max_payload
    }

    /// Per-stream window, never smaller than two full frames so a blocked
    /// sender always has half a window outstanding to be granted back.
    pub(crate) fn window(&self) -> usize {
        self.options
            .stream_window
            .max(2 * credit_cost(self.options.max_payload))
    }

    fn closed_error(&self) -> TunnelError {
        TunnelError::SessionClosed(
            self.close_reason
                .get()
                .map_or_else(|| "session closed".to_string(), ToString::to_string),
        )
    }

    fn new_entry(&self, state: StreamState) -> (StreamEntry, mpsc::UnboundedReceiver<Frame>, Fate) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fate: Fate = Arc::new(OnceLock::new());
        let entry = StreamEntry {
            state,
            tx,
            fate: Arc::clone(&fate),
            last_activity: Instant::now(),
            send_credit: self.window(),
            recv_used: 0,
            credit: Arc::new(Notify::new()),
        };
        (entry, rx, fate)
    }

    pub(crate) fn stream_state(&self, id: u64) -> Option<StreamState> {
        self.table().entries.get(&id).map(|e| e.state)
    }

    fn register_outgoing(self: &Arc<Self>) -> Result<TunnelStream> {
        let mut table = self.table();
        if table.closed {
            return Err(self.closed_error());
        }
        let id = table.high_water + 1;
        table.high_water = id;
        let (entry, rx, fate) = self.new_entry(StreamState::Created);
        table.entries.insert(id, entry);
        Ok(TunnelStream::new(id, Arc::clone(self), rx, fate))
    }

    /// Wait until `cost` bytes of send credit are available on stream `id`
    /// and take them.
    async fn acquire_credit(&self, id: u64, cost: usize, fate: &Fate) -> Result<()> {
        loop {
            let wake = {
                let mut table = self.table();
                let Some(entry) = table.entries.get_mut(&id) else {
                    return Err(stream_gone(id, fate));
                };
                if entry.send_credit >= cost {
                    entry.send_credit -= cost;
                    return Ok(());
                }
                Arc::clone(&entry.credit)
            };
            tokio::select! {
                () = wake.notified() => {}
                () = self.shutdown.cancelled() => return Err(self.closed_error()),
            }
        }
    }

    /// Hand `amount` bytes of receive credit on stream `id` back to the peer.
    pub(crate) fn grant(&self, id: u64, amount: usize) {
        {
            let mut table = self.table();
            let Some(entry) = table.entries.get_mut(&id) else {
                return;
            };
            entry.recv_used = entry.recv_used.saturating_sub(amount);
        }
        let increment = u32::try_from(amount).unwrap_or(u32::MAX);
        self.push_control(Frame::window_update(id, increment));
    }

    /// Apply a locally originated frame to its stream, then queue it.
    pub(crate) async fn send_frame(&self, frame: Frame, fate: &Fate) -> Result<()> {
        let id = frame.correlation_id;
        if frame.frame_type.is_body() {
            self.acquire_credit(id, credit_cost(frame.payload.len()), fate)
                .await?;
        }
        {
            let mut table = self.table();
            let Some(entry) = table.entries.get_mut(&id) else {
                return Err(stream_gone(id, fate));
            };
            let next = entry
                .state
                .advance(frame.frame_type)
                .map_err(|e| TunnelError::Protocol(format!("stream {id}: {e}")))?;
            entry.state = next;
            entry.last_activity = Instant::now();
            if next.is_terminal()
                && let Some(entry) = table.entries.remove(&id)
            {
                let outcome = match next {
                    StreamState::Cancelled => Outcome::Failed(TunnelError::Cancelled(format!(
                        "stream {id} cancelled locally"
                    ))),
                    _ => Outcome::Completed,
                };
                let _ = entry.fate.set(outcome);
                entry.wake();
            }
        }
        self.touch();
        self.outbound
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Drop a stream from the table and tell the peer. No-op for streams
    /// that already ended.
    pub(crate) fn cancel_stream(&self, id: u64, reason: &str) {
        self.fail_stream(id, TunnelError::Cancelled(reason.to_string()));
    }

    fn fail_stream(&self, id: u64, error: TunnelError) {
        let Some(entry) = self.table().entries.remove(&id) else {
            return;
        };
        debug!(session = %self.id, stream = id, error = %error, "Ending stream");
        let reason = error.to_string();
        let _ = entry.fate.set(Outcome::Failed(error));
        entry.wake();
        self.push_control(Frame::cancel(id, &reason));
    }

    /// Queue a frame from a synchronous context.
    fn push_control(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    handle.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
            }
        }
    }

    /// Validate an inbound frame against direction and stream state.
    fn route(self: &Arc<Self>, frame: &Frame) -> Result<Route> {
        let id = frame.correlation_id;
        let kind = frame.frame_type;
        match kind {
            FrameType::Ping if id == 0 => return Ok(Route::Control),
            FrameType::Ping => {
                return Err(TunnelError::Protocol(format!("ping on stream {id}")));
            }
            FrameType::WindowUpdate => return self.credit_peer(frame),
            _ => {}
        }
        match self.role {
            Role::Initiator if kind.is_request() => {
                return Err(TunnelError::Protocol(format!(
                    "{kind} frame for stream {id} from the responding side"
                )));
            }
            Role::Responder if kind.is_response() => {
                return Err(TunnelError::Protocol(format!(
                    "{kind} frame for stream {id} from the initiating side"
                )));
            }
            _ => {}
        }

        let mut table = self.table();
        if let Some(entry) = table.entries.get_mut(&id) {
            let next = entry
                .state
                .advance(kind)
                .map_err(|e| TunnelError::Protocol(format!("stream {id}: {e}")))?;
            entry.state = next;
            entry.last_activity = Instant::now();
            if kind.is_body() {
                entry.recv_used += credit_cost(frame.payload.len());
                if entry.recv_used > self.window() {
                    return Err(TunnelError::Protocol(format!(
                        "stream {id} overran its flow-control window"
                    )));
                }
            }
            let tx = entry.tx.clone();
            if next.is_terminal()
                && let Some(entry) = table.entries.remove(&id)
            {
                let _ = entry.fate.set(outcome_of(frame));
                entry.wake();
            }
            return Ok(Route::Deliver(tx));
        }

        if id == 0 {
            return Err(TunnelError::Protocol("correlation id 0 is reserved".into()));
        }
        if id <= table.high_water {
            if kind == FrameType::RequestHeader {
                return Err(TunnelError::Protocol(format!(
                    "correlation id {id} reused within session"
                )));
            }
            return Ok(Route::Retired);
        }
        if self.role == Role::Responder && kind == FrameType::RequestHeader {
            table.high_water = id;
            let (entry, rx, fate) = self.new_entry(StreamState::HeaderSent);
            let tx = entry.tx.clone();
            table.entries.insert(id, entry);
            return Ok(Route::Open(
                TunnelStream::new(id, Arc::clone(self), rx, fate),
                tx,
            ));
        }
        Err(TunnelError::Protocol(format!(
            "{kind} frame for unknown correlation id {id}"
        )))
    }

    /// Add peer-granted send credit to a stream.
    fn credit_peer(&self, frame: &Frame) -> Result<Route> {
        let id = frame.correlation_id;
        let increment = frame.window_increment().ok_or_else(|| {
            TunnelError::Protocol(format!("malformed window update for stream {id}"))
        })?;
        let mut table = self.table();
        if let Some(entry) = table.entries.get_mut(&id) {
            entry.send_credit = entry
                .send_credit
                .saturating_add(usize::try_from(increment).unwrap_or(usize::MAX));
            entry.last_activity = Instant::now();
            entry.wake();
            return Ok(Route::Control);
        }
        if id != 0 && id <= table.high_water {
            return Ok(Route::Retired);
        }
        Err(TunnelError::Protocol(format!(
            "window update for unknown correlation id {id}"
        )))
    }

    /// Hand a frame to its stream consumer. Never waits; the stream window
    /// bounds how much can queue up.
    fn deliver(&self, tx: &mpsc::UnboundedSender<Frame>, frame: Frame) {
        let id = frame.correlation_id;
        if tx.send(frame).is_err() {
            debug!(session = %self.id, stream = id, "Stream consumer gone, dropping frame");
        }
    }

    /// End the session and every stream on it. Only the first reason is kept.
    fn teardown(&self, reason: TunnelError) {
        let first = self.close_reason.set(reason.clone()).is_ok();
        let entries = {
            let mut table = self.table();
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        if first {
            if matches!(reason, TunnelError::SessionClosed(_)) {
                info!(session = %self.id, open_streams = entries.len(), %reason, "Tunnel session closed");
            } else {
                warn!(session = %self.id, open_streams = entries.len(), error = %reason, "Tunnel session lost");
            }
        }
        let stream_error = match &reason {
            TunnelError::SessionClosed(why) => TunnelError::SessionClosed(why.clone()),
            other => TunnelError::Transport(format!("tunnel session ended: {other}")),
        };
        for entry in entries.into_values() {
            let _ = entry.fate.set(Outcome::Failed(stream_error.clone()));
            entry.wake();
        }
        self.shutdown.cancel();
    }
}

fn stream_gone(id: u64, fate: &Fate) -> TunnelError {
    match fate.get() {
        Some(Outcome::Failed(e)) => e.clone(),
        _ => TunnelError::Cancelled(format!("stream {id} is no longer open")),
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct TunnelSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TunnelSession {
    /// Start the Bridge side of a session.
    pub fn initiator<S>(conn: Authenticated<S>, options: SessionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(conn, Role::Initiator, options, None)
    }

    /// Start the Offramp side of a session. Streams the peer opens arrive
    /// on the returned [`IncomingStreams`].
    pub fn responder<S>(conn: Authenticated<S>, options: SessionOptions) -> (Self, IncomingStreams)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (accept_tx, accept_rx) = mpsc::channel(options.accept_backlog);
        let session = Self::spawn(conn, Role::Responder, options, Some(accept_tx));
        (session, IncomingStreams::new(accept_rx))
    }

    fn spawn<S>(
        conn: Authenticated<S>,
        role: Role,
        options: SessionOptions,
        accept_tx: Option<mpsc::Sender<TunnelStream>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(options.send_queue_capacity);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            role,
            options,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            outbound,
            table: Mutex::new(StreamTable::default()),
            open_gate: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            close_reason: OnceLock::new(),
        });
        info!(session = %shared.id, ?role, "Tunnel session established");

        let (reader, writer) = tokio::io::split(conn.into_inner());
        tokio::spawn(read_loop(Arc::clone(&shared), reader, accept_tx));
        tokio::spawn(write_loop(Arc::clone(&shared), writer, outbound_rx));
        tokio::spawn(sweep_loop(Arc::clone(&shared)));
        tokio::spawn(heartbeat_loop(Arc::clone(&shared)));

        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    /// Last time a frame was read or queued on this session.
    pub fn last_activity(&self) -> Instant {
        let ms = self.shared.last_activity_ms.load(Ordering::Relaxed);
        self.shared.created_at + Duration::from_millis(ms)
    }

    pub fn auth_state(&self) -> AuthState {
        if self.is_closed() {
            AuthState::Closed
        } else {
            AuthState::Authenticated
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub fn active_streams(&self) -> usize {
        self.shared.table().entries.len()
    }

    pub fn close_reason(&self) -> Option<TunnelError> {
        self.shared.close_reason.get().cloned()
    }

    /// Close the session. Open streams fail with `SessionClosed`.
    pub fn close(&self, reason: &str) {
        self.shared
            .teardown(TunnelError::SessionClosed(reason.to_string()));
    }

    /// Resolves once the session has ended for any reason.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }

    /// Open a stream and send its request header.
    pub async fn open_stream(&self, head: &RequestHead) -> Result<TunnelStream> {
        if self.shared.role != Role::Initiator {
            return Err(TunnelError::Protocol(
                "only the initiating side opens streams".into(),
            ));
        }
        let payload = head.to_payload()?;
        if payload.len() > self.shared.options.max_payload {
            return Err(TunnelError::Protocol(format!(
                "request header of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                self.shared.options.max_payload
            )));
        }

        let _gate = self.shared.open_gate.lock().await;
        let stream = self.shared.register_outgoing()?;
        stream
            .sender()
            .send(FrameType::RequestHeader, payload)
            .await?;
        debug!(session = %self.shared.id, stream = stream.id(), method = %head.method, uri = %head.uri, "Opened stream");
        Ok(stream)
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    reader: R,
    accept_tx: Option<mpsc::Sender<TunnelStream>>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(shared.options.max_payload));
    let silence = shared.options.keepalive_timeout;
    let reason = loop {
        let next = tokio::select! {
            () = shared.shutdown.cancelled() => return,
            next = tokio::time::timeout(silence, frames.next()) => next,
        };
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => break TunnelError::from(e),
            Ok(None) => break TunnelError::Transport("connection closed by peer".into()),
            Err(_) => {
                break TunnelError::Transport(format!(
                    "no traffic from peer for {}s",
                    silence.as_secs_f32()
                ));
            }
        };
        shared.touch();

        match shared.route(&frame) {
            Ok(Route::Deliver(tx)) => shared.deliver(&tx, frame),
            Ok(Route::Open(stream, tx)) => {
                let id = frame.correlation_id;
                shared.deliver(&tx, frame);
                let Some(accept_tx) = accept_tx.as_ref() else {
                    continue;
                };
                match accept_tx.try_send(stream) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(stream)) => {
                        warn!(session = %shared.id, stream = id, "Accept backlog full, refusing stream");
                        shared.fail_stream(
                            id,
                            TunnelError::TargetUnavailable("offramp accept backlog full".into()),
                        );
                        drop(stream);
                    }
                    Err(mpsc::error::TrySendError::Closed(stream)) => {
                        debug!(session = %shared.id, stream = id, "No acceptor, refusing stream");
                        drop(stream);
                    }
                }
            }
            Ok(Route::Control) => {}
            Ok(Route::Retired) => {
                debug!(
                    session = %shared.id,
                    stream = frame.correlation_id,
                    frame_type = %frame.frame_type,
                    "Dropping late frame for finished stream"
                );
            }
            Err(e) => break e,
        }
    };
    shared.teardown(reason);
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut outbound: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new(shared.options.max_payload);
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        let frame = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mut encoded = codec.encode(frame, &mut buf);
        while encoded.is_ok() && buf.len() < WRITE_BATCH {
            match outbound.try_recv() {
                Ok(frame) => encoded = codec.encode(frame, &mut buf),
                Err(_) => break,
            }
        }
        if let Err(e) = encoded {
            shared.teardown(e.into());
            break;
        }

        let written = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        buf.clear();
        if let Err(e) = written {
            shared.teardown(TunnelError::Transport(format!("write failed: {e}")));
            break;
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
}

async fn sweep_loop(shared: Arc<Shared>) {
    let idle = shared.options.idle_timeout;
    let period = (idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut expired = Vec::new();
        shared.table().entries.retain(|id, entry| {
            if entry.last_activity.elapsed() < idle {
                return true;
            }
            let _ = entry.fate.set(Outcome::Failed(TunnelError::StreamTimeout(format!(
                "no activity on stream {id} for {}s",
                idle.as_secs_f32()
            ))));
            entry.wake();
            expired.push(*id);
            false
        });

        for id in expired {
            warn!(session = %shared.id, stream = id, "Stream idle timeout");
            shared.push_control(Frame::cancel(id, "stream idle timeout"));
        }
    }
}

/// Ping the peer on a fixed period so its reader sees traffic even when no
/// stream is open.
async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.options.keepalive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => return,
            _ = ticker.tick() => shared.push_control(Frame::ping()),
        }
    }
}

/// Two sessions joined over an in-memory pipe, already authenticated.
///
/// Returns `(initiator, responder, responder_incoming)`.
#[cfg(any(test, feature = "test-utils"))]
pub async fn test_session_pair(
    options: SessionOptions,
) -> Result<(TunnelSession, TunnelSession, IncomingStreams)> {
    use apitunnel_crypto::PskCredential;

    let psk = PskCredential::new("test-session-pair")
        .map_err(|e| TunnelError::Config(e.to_string()))?;
    let (client, server) = tokio::io::duplex(256 * 1024);
    let timeout = Duration::from_secs(5);
    let (client, server) = tokio::join!(
        crate::handshake::present_proof(client, &psk, timeout),
        crate::handshake::verify_proof(server, &psk, timeout),
    );
    let initiator = TunnelSession::initiator(client?, options);
    let (responder, incoming) = TunnelSession::responder(server?, options);
    Ok((initiator, responder, incoming))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests;
