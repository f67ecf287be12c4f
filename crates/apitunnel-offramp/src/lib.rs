//! apitunnel Offramp
//!
//! Private side of the tunnel: dials the Bridge, proves the pre-shared
//! key, and serves each stream the Bridge opens by calling the local
//! target service.

pub mod error;
pub mod target;
pub mod tunnel;

pub use error::TargetError;
pub use target::{HealthConfig, HealthTracker, TargetClient, TargetConfig};
pub use tunnel::{StreamDispatcher, Supervisor, SupervisorState};
