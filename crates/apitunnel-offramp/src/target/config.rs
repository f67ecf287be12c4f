//! Target service and health probe configuration.

use std::time::Duration;

/// Where tunnelled requests are sent.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    /// Time allowed to establish a TCP connection to the target.
    pub connect_timeout: Duration,
    /// Time allowed between sending a request and receiving its headers.
    /// Must stay below the tunnel's stream idle timeout so the target
    /// timeout is what the client sees.
    pub response_timeout: Duration,
}

impl TargetConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(25),
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// Reject a response timeout that would race the stream idle sweep.
    pub fn validate(&self, stream_idle_timeout: Duration) -> Result<(), String> {
        if self.response_timeout.is_zero() {
            return Err("target response timeout must be non-zero".into());
        }
        if self.response_timeout >= stream_idle_timeout {
            return Err(format!(
                "target response timeout ({}s) must be shorter than the stream idle timeout ({}s)",
                self.response_timeout.as_secs_f32(),
                stream_idle_timeout.as_secs_f32()
            ));
        }
        Ok(())
    }
}

/// Health monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before the target is marked unhealthy.
    pub failure_threshold: u32,
    /// Probe with `GET <path>` instead of a bare TCP connect.
    pub http_path: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
            http_path: None,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("health failure threshold must be at least 1".into());
        }
        if self.interval.is_zero() {
            return Err("health probe interval must be non-zero".into());
        }
        if self.probe_timeout.is_zero() {
            return Err("health probe timeout must be non-zero".into());
        }
        if let Some(path) = &self.http_path
            && !path.starts_with('/')
        {
            return Err(format!("health probe path {path:?} must start with '/'"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use apitunnel_core::TunnelSettings;

    use super::*;

    #[test]
    fn authority_brackets_ipv6() {
        assert_eq!(TargetConfig::new("localhost", 8080).authority(), "localhost:8080");
        assert_eq!(TargetConfig::new("::1", 80).authority(), "[::1]:80");
        assert_eq!(
            TargetConfig::new("127.0.0.1", 9000).base_url(),
            "http://127.0.0.1:9000"
        );
    }

    #[test]
    fn default_response_timeout_beats_idle_sweep() {
        let idle = TunnelSettings::default().stream_idle_timeout();
        let config = TargetConfig::new("localhost", 8080);
        assert!(config.response_timeout < idle);
        assert!(config.validate(idle).is_ok());

        let mut racing = config;
        racing.response_timeout = idle;
        assert!(racing.validate(idle).is_err());
        racing.response_timeout = Duration::ZERO;
        assert!(racing.validate(idle).is_err());
    }

    #[test]
    fn health_config_validation() {
        assert!(HealthConfig::default().validate().is_ok());
        let zero = HealthConfig {
            failure_threshold: 0,
            ..HealthConfig::default()
        };
        assert!(zero.validate().is_err());
        let relative = HealthConfig {
            http_path: Some("healthz".into()),
            ..HealthConfig::default()
        };
        assert!(relative.validate().is_err());
    }
}
