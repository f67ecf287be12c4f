//! The local service the Offramp forwards to, and its health.

pub mod client;
pub mod config;
pub mod health;

pub use client::TargetClient;
pub use config::{HealthConfig, TargetConfig};
pub use health::{HealthMonitor, HealthStatus, HealthTracker, HttpProbe, Probe, TargetHealth, TcpProbe};
