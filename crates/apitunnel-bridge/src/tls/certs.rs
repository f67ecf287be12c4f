//! Development certificates for the tunnel listener.
//!
//! Generates a throwaway CA and a server certificate signed by it. The CA
//! is written next to the server pair so an Offramp can trust it with
//! `--ca-cert`. NOT suitable for production use.

use std::path::Path;

use apitunnel_crypto::certs::{generate_ca, generate_server_cert};
use tracing::info;

/// Generated certificate bundle (PEM-encoded).
pub struct CertBundle {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

/// Mint a CA and a server certificate valid for `server_names`.
pub fn generate_dev_bundle(server_names: &[&str]) -> Result<CertBundle, CertError> {
    let ca = generate_ca("apitunnel Dev").map_err(|e| CertError::Generation(e.to_string()))?;
    let (server_cert_pem, server_key_pem) =
        generate_server_cert(&ca, server_names).map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CertBundle {
        ca_cert_pem: ca.ca_cert_pem,
        server_cert_pem,
        server_key_pem,
    })
}

/// Write `ca.pem`, `server.pem`, and `server-key.pem` into `dir`.
pub fn write_dev_certs(dir: &Path, bundle: &CertBundle) -> Result<(), CertError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CertError::Io(format!("Failed to create cert dir: {e}")))?;

    let ca_path = dir.join("ca.pem");
    let cert_path = dir.join("server.pem");
    let key_path = dir.join("server-key.pem");

    for (path, pem) in [
        (&ca_path, &bundle.ca_cert_pem),
        (&cert_path, &bundle.server_cert_pem),
        (&key_path, &bundle.server_key_pem),
    ] {
        std::fs::write(path, pem)
            .map_err(|e| CertError::Io(format!("Failed to write {}: {e}", path.display())))?;
    }

    info!(
        ca = %ca_path.display(),
        cert = %cert_path.display(),
        "Dev certificates written"
    );
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(String),
}
