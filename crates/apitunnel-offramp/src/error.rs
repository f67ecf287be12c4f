//! Target-side error types.

use std::time::Duration;

use apitunnel_core::TunnelError;

/// Errors reaching or talking to the target service.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("Target connection failed: {0}")]
    Connect(String),

    #[error("Target did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Target HTTP error: {0}")]
    Http(String),

    #[error("Invalid request for target: {0}")]
    InvalidRequest(String),
}

impl TargetError {
    /// Classify a reqwest failure.
    pub fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<TargetError> for TunnelError {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::Connect(_) | TargetError::Http(_) => {
                Self::TargetUnavailable(err.to_string())
            }
            TargetError::Timeout(_) => Self::TargetTimeout(err.to_string()),
            TargetError::InvalidRequest(_) => Self::Protocol(err.to_string()),
        }
    }
}
