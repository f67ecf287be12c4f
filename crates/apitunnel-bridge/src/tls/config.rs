//! rustls server configuration for the Bridge listeners.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use super::certs::{generate_dev_bundle, write_dev_certs};

/// How a listener secures its connections.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Plaintext. Development only.
    Disabled,
    /// Generate a CA and server certificate into `cert_dir` at startup.
    DevSelfSigned { cert_dir: PathBuf },
    /// Operator-provided PEM certificate chain and private key.
    Custom { cert_path: PathBuf, key_path: PathBuf },
}

impl TlsMode {
    /// Build a TLS acceptor for this mode, or `None` when disabled.
    pub fn acceptor(&self) -> Result<Option<TlsAcceptor>, TlsConfigError> {
        Ok(self.server_config()?.map(TlsAcceptor::from))
    }

    pub fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, TlsConfigError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        match self {
            Self::Disabled => Ok(None),
            Self::DevSelfSigned { cert_dir } => {
                info!("Generating dev TLS certificates");
                let bundle = generate_dev_bundle(&["localhost", "127.0.0.1"])
                    .map_err(|e| TlsConfigError::CertGeneration(e.to_string()))?;
                write_dev_certs(cert_dir, &bundle)
                    .map_err(|e| TlsConfigError::CertGeneration(e.to_string()))?;

                let certs = parse_certs(bundle.server_cert_pem.as_bytes(), Path::new("<dev>"))?;
                let key = parse_key(bundle.server_key_pem.as_bytes(), Path::new("<dev>"))?;
                info!(cert_dir = %cert_dir.display(), "Dev TLS enabled");
                build(certs, key).map(Some)
            }
            Self::Custom {
                cert_path,
                key_path,
            } => {
                let cert_pem = read(cert_path)?;
                let key_pem = read(key_path)?;
                let certs = parse_certs(&cert_pem, cert_path)?;
                let key = parse_key(&key_pem, key_path)?;
                info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "Custom TLS enabled"
                );
                build(certs, key).map(Some)
            }
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    std::fs::read(path)
        .map_err(|e| TlsConfigError::FileRead(format!("Failed to read {}: {e}", path.display())))
}

fn parse_certs(pem: &[u8], origin: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::InvalidPem(format!("{}: {e}", origin.display())))?;
    if certs.is_empty() {
        return Err(TlsConfigError::InvalidPem(format!(
            "{}: no certificates found",
            origin.display()
        )));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8], origin: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TlsConfigError::InvalidPem(format!("{}: {e}", origin.display())))?
        .ok_or_else(|| {
            TlsConfigError::InvalidPem(format!("{}: no private key found", origin.display()))
        })
}

fn build(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("File read error: {0}")]
    FileRead(String),

    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(String),
}
