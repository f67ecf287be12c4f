//! apitunnel Bridge
//!
//! Public HTTP listener plus the tunnel port an Offramp dials into.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use apitunnel_bridge::tls::TlsMode;
use apitunnel_bridge::{BridgeState, HttpServer, SessionRegistry, TunnelAcceptor, build_router};
use apitunnel_core::config::load_settings;
use apitunnel_core::tracing_init::{default_filter, init_tracing};
use apitunnel_crypto::PskCredential;

#[derive(Parser, Debug)]
#[command(name = "api-bridge")]
#[command(version, about = "apitunnel Bridge - public HTTP listener and tunnel acceptor")]
struct Args {
    /// IP address both listeners bind to.
    #[arg(long, env = "APITUNNEL_LISTEN_IP", default_value = "0.0.0.0")]
    listen_ip: IpAddr,

    /// Port for external HTTP(S) clients.
    #[arg(long, env = "APITUNNEL_LISTEN_PORT", default_value_t = 8000)]
    listen_port: u16,

    /// Port the Offramp connects to.
    #[arg(long, env = "APITUNNEL_TUNNEL_PORT", default_value_t = 8001)]
    tunnel_port: u16,

    /// Pre-shared key the Offramp must prove.
    #[arg(long, env = "APITUNNEL_PSK", hide_env_values = true)]
    psk: String,

    /// Serve external clients over HTTPS.
    #[arg(long, requires_all = ["cert_file", "key_file"])]
    enable_https: bool,

    /// Certificate chain (PEM) for the external HTTPS listener.
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// Private key (PEM) for the external HTTPS listener.
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Secure the tunnel port with auto-generated dev certificates.
    #[arg(long, conflicts_with = "tunnel_tls_cert")]
    tunnel_dev_tls: bool,

    /// Certificate chain (PEM) for the tunnel port.
    #[arg(long, requires = "tunnel_tls_key")]
    tunnel_tls_cert: Option<PathBuf>,

    /// Private key (PEM) for the tunnel port.
    #[arg(long, requires = "tunnel_tls_cert")]
    tunnel_tls_key: Option<PathBuf>,

    /// JSON file with tunnel protocol settings.
    #[arg(long, env = "APITUNNEL_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log level for apitunnel crates when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn external_tls(&self) -> TlsMode {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) if self.enable_https => TlsMode::Custom {
                cert_path: cert.clone(),
                key_path: key.clone(),
            },
            _ => TlsMode::Disabled,
        }
    }

    fn tunnel_tls(&self) -> anyhow::Result<TlsMode> {
        if self.tunnel_dev_tls {
            let cert_dir = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?
                .join(".apitunnel")
                .join("certs");
            return Ok(TlsMode::DevSelfSigned { cert_dir });
        }
        Ok(match (&self.tunnel_tls_cert, &self.tunnel_tls_key) {
            (Some(cert), Some(key)) => TlsMode::Custom {
                cert_path: cert.clone(),
                key_path: key.clone(),
            },
            _ => TlsMode::Disabled,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &default_filter("apitunnel_bridge", &args.log_level),
        args.log_json,
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_ip = %args.listen_ip,
        http_port = args.listen_port,
        tunnel_port = args.tunnel_port,
        "Starting api-bridge"
    );

    let settings = load_settings(args.settings.as_deref())?;
    let psk = PskCredential::new(args.psk.as_bytes())?;

    let tunnel_tls = args.tunnel_tls()?;
    if matches!(tunnel_tls, TlsMode::Disabled) {
        warn!("Tunnel port is plaintext; use only on trusted networks");
    }
    let tunnel_acceptor = tunnel_tls.acceptor()?;
    let http_acceptor = args.external_tls().acceptor()?;

    let registry = SessionRegistry::new();
    let router = build_router(BridgeState {
        sessions: registry.clone(),
    });

    let tunnel_listener =
        TcpListener::bind(SocketAddr::new(args.listen_ip, args.tunnel_port)).await?;
    let http_listener = TcpListener::bind(SocketAddr::new(args.listen_ip, args.listen_port)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let acceptor = TunnelAcceptor::new(psk, settings, registry.clone(), tunnel_acceptor);
    let tunnel_task = tokio::spawn(acceptor.run(tunnel_listener, shutdown_rx.clone()));
    let http_task = tokio::spawn(HttpServer::new(router, http_acceptor).run(http_listener, shutdown_rx));

    shutdown_signal().await;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    registry.shutdown("bridge shutting down").await;

    let _ = tokio::join!(tunnel_task, http_task);
    info!("Bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
