//! TLS setup for the tunnel listener and the external HTTPS listener.

pub mod certs;
pub mod config;

pub use certs::{CertBundle, CertError, generate_dev_bundle, write_dev_certs};
pub use config::{TlsConfigError, TlsMode};
