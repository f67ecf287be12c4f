//! apitunnel Offramp
//!
//! Dials the Bridge and forwards tunnelled requests to a local target.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use apitunnel_core::config::load_settings;
use apitunnel_core::tracing_init::{default_filter, init_tracing};
use apitunnel_crypto::PskCredential;
use apitunnel_offramp::target::{HealthMonitor, HttpProbe, TcpProbe};
use apitunnel_offramp::tunnel::{BridgeConnector, BridgeEndpoint, ReconnectPolicy, TlsTrust};
use apitunnel_offramp::{
    HealthConfig, HealthTracker, StreamDispatcher, Supervisor, TargetClient, TargetConfig,
};

#[derive(Parser, Debug)]
#[command(name = "api-offramp")]
#[command(version, about = "apitunnel Offramp - forwards tunnelled requests to a local target")]
struct Args {
    /// Bridge host to dial.
    #[arg(long, env = "APITUNNEL_REMOTE_IP")]
    remote_ip: String,

    /// Bridge tunnel port.
    #[arg(long, env = "APITUNNEL_REMOTE_PORT", default_value_t = 8081)]
    remote_port: u16,

    /// Pre-shared key proven to the Bridge.
    #[arg(long, env = "APITUNNEL_PSK", hide_env_values = true)]
    psk: String,

    /// Host of the service requests are forwarded to.
    #[arg(long, env = "APITUNNEL_TARGET_HOST", default_value = "localhost")]
    target_host: String,

    /// Port of the service requests are forwarded to.
    #[arg(long, env = "APITUNNEL_TARGET_PORT", default_value_t = 8080)]
    target_port: u16,

    /// Seconds to wait for the target's response headers. Must be shorter
    /// than the tunnel's stream idle timeout.
    #[arg(long, default_value_t = 25)]
    target_timeout: u64,

    /// Wrap the tunnel connection in TLS.
    #[arg(long)]
    tls: bool,

    /// CA certificate (PEM) that signed the Bridge certificate.
    #[arg(long, requires = "tls", conflicts_with = "insecure_skip_verify")]
    ca_cert: Option<PathBuf>,

    /// Accept any Bridge certificate. Development only.
    #[arg(long, requires = "tls")]
    insecure_skip_verify: bool,

    /// Name to verify the Bridge certificate against (defaults to --remote-ip).
    #[arg(long, requires = "tls")]
    tls_server_name: Option<String>,

    /// Initial reconnect delay in milliseconds.
    #[arg(long, default_value_t = 1000)]
    reconnect_initial_ms: u64,

    /// Maximum reconnect delay in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    reconnect_max_ms: u64,

    /// Give up after this many consecutive failed attempts.
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Milliseconds between target health probes.
    #[arg(long, default_value_t = 1000)]
    health_interval_ms: u64,

    /// Milliseconds before a health probe counts as failed.
    #[arg(long, default_value_t = 2000)]
    health_timeout_ms: u64,

    /// Consecutive failed probes before the target is marked unhealthy.
    #[arg(long, default_value_t = 3)]
    health_failure_threshold: u32,

    /// Probe with an HTTP GET to this path instead of a TCP connect.
    #[arg(long)]
    health_path: Option<String>,

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
    fn endpoint(&self) -> anyhow::Result<BridgeEndpoint> {
        let mut endpoint = BridgeEndpoint::new(self.remote_ip.clone(), self.remote_port);
        endpoint.server_name.clone_from(&self.tls_server_name);
        if self.tls {
            endpoint.tls = Some(match (&self.ca_cert, self.insecure_skip_verify) {
                (Some(ca), _) => TlsTrust::CustomCa(ca.clone()),
                (None, true) => TlsTrust::InsecureSkipVerify,
                (None, false) => anyhow::bail!("--tls needs --ca-cert or --insecure-skip-verify"),
            });
        }
        Ok(endpoint)
    }

    fn reconnect(&self) -> anyhow::Result<ReconnectPolicy> {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.max_reconnect_attempts,
            ..ReconnectPolicy::default()
        };
        policy.validate().map_err(anyhow::Error::msg)?;
        Ok(policy)
    }

    fn target(&self) -> TargetConfig {
        let mut target = TargetConfig::new(self.target_host.clone(), self.target_port);
        target.response_timeout = Duration::from_secs(self.target_timeout);
        target
    }

    fn health(&self) -> anyhow::Result<HealthConfig> {
        let health = HealthConfig {
            interval: Duration::from_millis(self.health_interval_ms),
            probe_timeout: Duration::from_millis(self.health_timeout_ms),
            failure_threshold: self.health_failure_threshold,
            http_path: self.health_path.clone(),
        };
        health.validate().map_err(anyhow::Error::msg)?;
        Ok(health)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &default_filter("apitunnel_offramp", &args.log_level),
        args.log_json,
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        remote = %format!("{}:{}", args.remote_ip, args.remote_port),
        target = %format!("{}:{}", args.target_host, args.target_port),
        "Starting api-offramp"
    );

    let settings = load_settings(args.settings.as_deref())?;
    let psk = PskCredential::new(args.psk.as_bytes())?;
    let endpoint = args.endpoint()?;
    if endpoint.tls.is_none() {
        warn!("Tunnel connection is plaintext; use only on trusted networks");
    }
    let connector = BridgeConnector::from_endpoint(&endpoint)?;
    let policy = args.reconnect()?;
    let target = args.target();
    target
        .validate(settings.stream_idle_timeout())
        .map_err(anyhow::Error::msg)?;
    let health_config = args.health()?;

    let health = Arc::new(HealthTracker::new(health_config.failure_threshold));
    let client = TargetClient::new(&target)?;
    let dispatcher = Arc::new(StreamDispatcher::new(client, Arc::clone(&health)));
    let supervisor = Supervisor::new(connector, psk, settings, policy, dispatcher)
        .with_connect_timeout(endpoint.connect_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_rx = shutdown_rx.clone();
    let monitor_handle = match &health_config.http_path {
        Some(path) => {
            let probe = HttpProbe::new(&target, path, health_config.probe_timeout)?;
            let monitor = HealthMonitor::new(probe, Arc::clone(&health), &health_config);
            tokio::spawn(monitor.run(monitor_rx))
        }
        None => {
            let probe = TcpProbe::new(&target, health_config.probe_timeout);
            let monitor = HealthMonitor::new(probe, Arc::clone(&health), &health_config);
            tokio::spawn(monitor.run(monitor_rx))
        }
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let run = supervisor.run(shutdown_rx);
    tokio::pin!(run);

    let outcome = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = monitor_handle.await;

    match outcome {
        Ok(()) => {
            info!("Offramp stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Offramp giving up");
            Err(e.into())
        }
    }
}
