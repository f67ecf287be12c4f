//! Keeps one authenticated session to the Bridge alive.
//!
//! `Disconnected → Connecting → Authenticating → Active`, and back to
//! `Disconnected` when the session is lost. Failed attempts back off
//! exponentially with jitter; a successful authentication resets the
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use apitunnel_core::{Authenticated, TunnelError, TunnelSession, TunnelSettings, present_proof};
use apitunnel_crypto::PskCredential;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::backoff::BackoffState;
use super::config::ReconnectPolicy;
use super::connector::{BoxedIo, Connector};
use super::handler::StreamDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
}

/// How one connection attempt ended.
enum Exit {
    Shutdown,
    Lost(Option<TunnelError>),
}

pub struct Supervisor<C> {
    connector: C,
    psk: PskCredential,
    settings: TunnelSettings,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    dispatcher: Arc<StreamDispatcher>,
    state: watch::Sender<SupervisorState>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        psk: PskCredential,
        settings: TunnelSettings,
        policy: ReconnectPolicy,
        dispatcher: Arc<StreamDispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            connector,
            psk,
            settings,
            policy,
            connect_timeout: Duration::from_secs(10),
            dispatcher,
            state,
        }
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SupervisorState) {
        self.state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    /// Run until `shutdown` flips to `true`. Returns an error only when
    /// `max_attempts` consecutive attempts have failed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let mut backoff = BackoffState::new(self.policy.clone());
        info!(bridge = %self.connector.describe(), "Tunnel supervisor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_serve(&mut backoff, &mut shutdown).await {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Lost(reason)) => {
                    let reason = reason.map_or_else(|| "unknown".to_string(), |e| e.to_string());
                    warn!(%reason, "Tunnel session lost");
                }
                Err(e) => warn!(error = %e, attempt = backoff.attempt() + 1, "Tunnel connection attempt failed"),
            }
            self.set_state(SupervisorState::Disconnected);

            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempt(), "Max reconnect attempts reached");
                return Err(TunnelError::Transport(format!(
                    "gave up after {} failed attempts",
                    backoff.attempt()
                )));
            };
            info!(delay_ms = delay.as_millis(), attempt = backoff.attempt(), "Reconnecting");

            tokio::select! {
                () = sleep(delay) => {}
                () = stopped(&mut shutdown) => break,
            }
        }

        self.set_state(SupervisorState::Disconnected);
        info!("Tunnel supervisor stopped");
        Ok(())
    }

    async fn connect_and_serve(
        &self,
        backoff: &mut BackoffState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Exit, TunnelError> {
        let conn = tokio::select! {
            established = self.establish() => established?,
            () = stopped(shutdown) => return Ok(Exit::Shutdown),
        };

        let (session, mut incoming) =
            TunnelSession::responder(conn, self.settings.session_options());
        backoff.reset();
        self.set_state(SupervisorState::Active);
        info!(session = %session.id(), bridge = %self.connector.describe(), "Tunnel active");

        loop {
            tokio::select! {
                accepted = incoming.accept() => match accepted {
                    Some(stream) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        tokio::spawn(async move { dispatcher.dispatch(stream).await });
                    }
                    None => break,
                },
                () = stopped(shutdown) => {
                    session.close("offramp shutting down");
                    return Ok(Exit::Shutdown);
                }
            }
        }

        session.closed().await;
        Ok(Exit::Lost(session.close_reason()))
    }

    /// Dial the Bridge and prove the key.
    async fn establish(&self) -> Result<Authenticated<BoxedIo>, TunnelError> {
        self.set_state(SupervisorState::Connecting);
        let io = tokio::time::timeout(self.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                TunnelError::Transport(format!("connect timed out after {:?}", self.connect_timeout))
            })??;

        self.set_state(SupervisorState::Authenticating);
        present_proof(io, &self.psk, self.settings.handshake_timeout()).await
    }
}

/// Resolves once shutdown is requested. A dropped sender never resolves.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
