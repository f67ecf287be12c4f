//! Tunnel acceptor: accepts Offramp connections on the tunnel port,
//! authenticates them, and installs the resulting session.

use std::net::SocketAddr;

use apitunnel_core::{TunnelError, TunnelSession, TunnelSettings, verify_proof};
use apitunnel_crypto::PskCredential;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct TunnelAcceptor {
    psk: PskCredential,
    settings: TunnelSettings,
    registry: SessionRegistry,
    tls: Option<TlsAcceptor>,
}

impl TunnelAcceptor {
    pub const fn new(
        psk: PskCredential,
        settings: TunnelSettings,
        registry: SessionRegistry,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            psk,
            settings,
            registry,
            tls,
        }
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(
                %addr,
                tls = self.tls.is_some(),
                psk = %self.psk.fingerprint(),
                "Tunnel acceptor listening"
            );
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Tunnel acceptor stopping");
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let acceptor = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = acceptor.handle(stream, peer).await {
                                warn!(%peer, error = %e, "Tunnel connection rejected");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept tunnel connection"),
                },
            }
        }
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TunnelError> {
        debug!(%peer, "Tunnel connection accepted");
        let _ = stream.set_nodelay(true);
        match &self.tls {
            Some(tls) => {
                let stream = tokio::time::timeout(
                    self.settings.handshake_timeout(),
                    tls.accept(stream),
                )
                .await
                .map_err(|_| TunnelError::Authentication("TLS handshake timed out".into()))?
                .map_err(|e| TunnelError::Transport(format!("TLS handshake failed: {e}")))?;
                self.admit(stream, peer).await
            }
            None => self.admit(stream, peer).await,
        }
    }

    /// Authenticate `io`, run it as the active session, and clear the slot
    /// once it ends.
    async fn admit<S>(&self, io: S, peer: SocketAddr) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = verify_proof(io, &self.psk, self.settings.handshake_timeout()).await?;
        let session = TunnelSession::initiator(conn, self.settings.session_options());
        info!(%peer, session = %session.id(), "Offramp authenticated");
        self.registry.install(session.clone()).await;

        session.closed().await;
        self.registry.remove(session.id()).await;
        info!(
            %peer,
            session = %session.id(),
            reason = %session
                .close_reason()
                .map_or_else(|| "unknown".to_string(), |e| e.to_string()),
            "Offramp disconnected"
        );
        Ok(())
    }
}
