//! HTTP/1.1 accept loop for the external listener, with optional TLS.

use std::net::SocketAddr;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Serves `router` to external clients.
pub struct HttpServer {
    router: Router,
    tls: Option<TlsAcceptor>,
}

impl HttpServer {
    pub const fn new(router: Router, tls: Option<TlsAcceptor>) -> Self {
        Self { router, tls }
    }

    pub const fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, https = self.has_tls(), "HTTP listener ready");
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("HTTP listener stopping");
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let router = self.router.clone();
                        let tls = self.tls.clone();
                        tokio::spawn(async move {
                            match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => serve(stream, router, peer).await,
                                    Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                                },
                                None => serve(stream, router, peer).await,
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept HTTP connection"),
                },
            }
        }
    }
}

async fn serve<S>(io: S, router: Router, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router);
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!(%peer, error = %e, "HTTP connection ended with error");
    }
}
