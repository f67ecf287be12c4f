//! Tunnel settings shared by the Bridge and the Offramp.
//!
//! Resolution order (lowest to highest):
//! 1. Built-in defaults
//! 2. JSON settings file (`--settings`)
//! 3. Environment variables (`APITUNNEL_*`)
//!
//! CLI flags of each binary are applied on top by the binary itself.

use std::path::Path;
use std::time::Duration;

use apitunnel_proto::{DEFAULT_MAX_PAYLOAD, HEADER_LEN, MAX_PAYLOAD_CEILING};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::session::SessionOptions;

/// Both endpoints must agree on these for the protocol to behave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Largest frame payload accepted or emitted, in bytes.
    pub max_frame_payload: usize,
    /// Bound on the whole PSK exchange.
    pub handshake_timeout_secs: u64,
    /// A stream with no frame movement for this long is failed.
    pub stream_idle_timeout_secs: u64,
    /// Frames buffered for the connection writer.
    pub send_queue_capacity: usize,
    /// Body bytes (frame headers included) a sender may have in flight on
    /// one stream before the receiver grants more.
    pub stream_window_bytes: usize,
    /// Peer-opened streams waiting to be picked up. Streams past this are
    /// refused.
    pub accept_backlog: usize,
    /// How often each side pings an otherwise quiet connection.
    pub keepalive_interval_secs: u64,
    /// A connection with no inbound frame for this long is dead.
    pub keepalive_timeout_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
            handshake_timeout_secs: 5,
            stream_idle_timeout_secs: 30,
            send_queue_capacity: 256,
            stream_window_bytes: 1024 * 1024,
            accept_backlog: 64,
            keepalive_interval_secs: 10,
            keepalive_timeout_secs: 30,
        }
    }
}

impl TunnelSettings {
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub const fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    /// Reject settings the session layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_PAYLOAD_CEILING {
            return Err(TunnelError::Config(format!(
                "max_frame_payload must be between 1 and {MAX_PAYLOAD_CEILING} bytes, got {}",
                self.max_frame_payload
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(TunnelError::Config(
                "handshake_timeout_secs must be positive".into(),
            ));
        }
        if self.stream_idle_timeout_secs == 0 {
            return Err(TunnelError::Config(
                "stream_idle_timeout_secs must be positive".into(),
            ));
        }
        if self.send_queue_capacity == 0 || self.accept_backlog == 0 {
            return Err(TunnelError::Config(
                "queue capacities must be positive".into(),
            ));
        }
        let min_window = 2 * (self.max_frame_payload + HEADER_LEN);
        if self.stream_window_bytes < min_window
            || u32::try_from(self.stream_window_bytes).is_err()
        {
            return Err(TunnelError::Config(format!(
                "stream_window_bytes must be at least {min_window} (two full frames) and fit in 32 bits, got {}",
                self.stream_window_bytes
            )));
        }
        if self.keepalive_interval_secs == 0
            || self.keepalive_timeout_secs <= self.keepalive_interval_secs
        {
            return Err(TunnelError::Config(format!(
                "keepalive_timeout_secs ({}) must exceed a positive keepalive_interval_secs ({})",
                self.keepalive_timeout_secs, self.keepalive_interval_secs
            )));
        }
        Ok(())
    }

    /// Runtime knobs for a `TunnelSession`.
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_payload: self.max_frame_payload,
            idle_timeout: self.stream_idle_timeout(),
            send_queue_capacity: self.send_queue_capacity,
            stream_window: self.stream_window_bytes,
            accept_backlog: self.accept_backlog,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
        }
    }
}

/// Resolve settings from defaults, an optional file, and the environment.
pub fn load_settings(path: Option<&Path>) -> Result<TunnelSettings> {
    let mut settings = match path {
        Some(path) => load_settings_file(path)?,
        None => TunnelSettings::default(),
    };
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_settings_file(path: &Path) -> Result<TunnelSettings> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        TunnelError::Config(format!(
            "Failed to read settings file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        TunnelError::Config(format!(
            "Failed to parse settings file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Apply `APITUNNEL_*` overrides. Unparseable values are ignored.
fn apply_overrides(settings: &mut TunnelSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("APITUNNEL_MAX_FRAME_PAYLOAD").and_then(|v| v.parse().ok()) {
        settings.max_frame_payload = n;
    }
    if let Some(n) = lookup("APITUNNEL_HANDSHAKE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.handshake_timeout_secs = n;
    }
    if let Some(n) = lookup("APITUNNEL_STREAM_IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.stream_idle_timeout_secs = n;
    }
    if let Some(n) = lookup("APITUNNEL_KEEPALIVE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.keepalive_timeout_secs = n;
    }
}
