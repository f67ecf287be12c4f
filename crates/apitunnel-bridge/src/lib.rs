//! apitunnel Bridge
//!
//! Public side of the tunnel: accepts HTTP clients, accepts exactly one
//! authenticated Offramp connection at a time, and forwards each client
//! request as a stream over that connection.

pub mod acceptor;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod tls;

pub use acceptor::TunnelAcceptor;
pub use proxy::{BridgeState, build_router};
pub use registry::{SessionInfo, SessionRegistry};
pub use server::HttpServer;
