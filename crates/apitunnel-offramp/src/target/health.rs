//! Target health tracking.
//!
//! The monitor probes the target on its own timer and records results in
//! a [`HealthTracker`]. The forwarding path only reads an atomic flag and
//! never waits on a probe.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::{HealthConfig, TargetConfig};
use crate::error::TargetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Snapshot published after every probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_probe: Option<Instant>,
}

/// Shared health state. The target starts out healthy.
pub struct HealthTracker {
    healthy: AtomicBool,
    threshold: u32,
    state: watch::Sender<TargetHealth>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        let (state, _) = watch::channel(TargetHealth {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_probe: None,
        });
        Self {
            healthy: AtomicBool::new(true),
            threshold: failure_threshold.max(1),
            state,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> TargetHealth {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TargetHealth> {
        self.state.subscribe()
    }

    /// Record one probe outcome and return the resulting snapshot.
    pub fn record(&self, success: bool) -> TargetHealth {
        let threshold = self.threshold;
        self.state.send_modify(|health| {
            health.last_probe = Some(Instant::now());
            if success {
                health.consecutive_failures = 0;
                health.status = HealthStatus::Healthy;
            } else {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                if health.consecutive_failures >= threshold {
                    health.status = HealthStatus::Unhealthy;
                }
            }
        });
        let snapshot = self.snapshot();
        self.healthy.store(
            snapshot.status == HealthStatus::Healthy,
            Ordering::Release,
        );
        snapshot
    }
}

/// One liveness check against the target.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = Result<(), TargetError>> + Send;
}

/// Healthy when a TCP connection can be opened.
pub struct TcpProbe {
    authority: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: &TargetConfig, timeout: Duration) -> Self {
        Self {
            authority: target.authority(),
            timeout,
        }
    }
}

impl Probe for TcpProbe {
    async fn probe(&self) -> Result<(), TargetError> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.authority)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TargetError::Connect(e.to_string())),
            Err(_) => Err(TargetError::Timeout(self.timeout)),
        }
    }
}

/// Healthy when `GET <path>` answers with a non-5xx status.
pub struct HttpProbe {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(target: &TargetConfig, path: &str, timeout: Duration) -> Result<Self, TargetError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| TargetError::Http(format!("failed to build probe client: {e}")))?;
        Ok(Self {
            http,
            url: format!("{}{path}", target.base_url()),
            timeout,
        })
    }
}

impl Probe for HttpProbe {
    async fn probe(&self) -> Result<(), TargetError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TargetError::from_reqwest(&e, self.timeout))?;
        if response.status().is_server_error() {
            return Err(TargetError::Http(format!(
                "probe answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Periodically probes the target and feeds a [`HealthTracker`].
pub struct HealthMonitor<P> {
    probe: P,
    tracker: Arc<HealthTracker>,
    interval: Duration,
}

impl<P: Probe> HealthMonitor<P> {
    pub fn new(probe: P, tracker: Arc<HealthTracker>, config: &HealthConfig) -> Self {
        Self {
            probe,
            tracker,
            interval: config.interval,
        }
    }

    /// Probe until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => self.check().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Run one probe and record it.
    pub async fn check(&self) {
        let was_healthy = self.tracker.is_healthy();
        let result = self.probe.probe().await;
        let health = self.tracker.record(result.is_ok());
        match (&result, was_healthy, health.status) {
            (Err(e), true, HealthStatus::Unhealthy) => warn!(
                error = %e,
                failures = health.consecutive_failures,
                "Target marked unhealthy"
            ),
            (Ok(()), false, HealthStatus::Healthy) => info!("Target healthy again"),
            (Err(e), _, _) => debug!(
                error = %e,
                failures = health.consecutive_failures,
                "Health probe failed"
            ),
            (Ok(()), _, _) => {}
        }
    }
}
