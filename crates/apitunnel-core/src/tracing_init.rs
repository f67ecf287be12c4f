//! Logging setup shared by `api-bridge` and `api-offramp`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, TunnelError};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. With `log_json` every
/// event is written as one JSON object per line.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| TunnelError::Config(format!("invalid log filter {default_filter:?}: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    installed.map_err(|e| TunnelError::Config(format!("tracing already initialised: {e}")))
}

/// Build the default filter string for a binary from its `--log-level`.
pub fn default_filter(crate_target: &str, level: &str) -> String {
    format!("{crate_target}={level},apitunnel_core={level},apitunnel_proto={level},warn")
}
