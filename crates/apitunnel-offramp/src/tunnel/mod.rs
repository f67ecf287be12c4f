//! Outbound tunnel to the Bridge.
//!
//! Provides the connection to the Bridge with automatic reconnection and
//! per-stream dispatch to the target.

pub mod backoff;
pub mod config;
pub mod connector;
pub mod handler;
pub mod supervisor;

pub use backoff::BackoffState;
pub use config::{BridgeEndpoint, ReconnectPolicy, TlsTrust};
pub use connector::{BridgeConnector, Connector, TcpConnector, TlsConfigError, TlsConnector};
pub use handler::StreamDispatcher;
pub use supervisor::{Supervisor, SupervisorState};
