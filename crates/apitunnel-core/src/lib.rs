//! apitunnel Core Library
//!
//! Shared functionality for the Bridge and the Offramp:
//! - Error taxonomy for the tunnel
//! - Tunnel settings resolution (defaults, JSON file, environment)
//! - Tracing initialization
//! - PSK handshake over an established byte stream
//! - Tunnel sessions multiplexing request/response streams over one connection

pub mod config;
pub mod error;
pub mod handshake;
pub mod session;
pub mod tracing_init;

pub use config::TunnelSettings;
pub use error::{Result, TunnelError};
pub use handshake::{Authenticated, present_proof, verify_proof};
#[cfg(any(test, feature = "test-utils"))]
pub use session::test_session_pair;
pub use session::{
    AuthState, IncomingStreams, Role, SessionOptions, StreamSender, StreamState, TunnelSession,
    TunnelStream,
};
