//! Dialers for the Bridge's tunnel port.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use apitunnel_core::TunnelError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::config::{BridgeEndpoint, TlsTrust};

/// A duplex byte stream to the Bridge.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedIo = Box<dyn TunnelIo>;

/// Opens one physical connection to the Bridge per call.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<BoxedIo, TunnelError>> + Send;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    async fn dial(&self) -> Result<TcpStream, TunnelError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TunnelError::Transport(format!("connect {}: {e}", self.address)))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedIo, TunnelError> {
        Ok(Box::new(self.dial().await?))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// TCP wrapped in rustls.
#[derive(Clone)]
pub struct TlsConnector {
    tcp: TcpConnector,
    server_name: ServerName<'static>,
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(
        address: impl Into<String>,
        server_name: &str,
        trust: &TlsTrust,
    ) -> Result<Self, TlsConfigError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsConfigError::InvalidServerName(server_name.to_string()))?;
        let config = client_config(trust)?;
        Ok(Self {
            tcp: TcpConnector::new(address),
            server_name,
            inner: tokio_rustls::TlsConnector::from(config),
        })
    }
}

impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedIo, TunnelError> {
        let tcp = self.tcp.dial().await?;
        let tls = self
            .inner
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| TunnelError::Transport(format!("TLS handshake failed: {e}")))?;
        debug!(address = %self.tcp.address, "TLS established");
        Ok(Box::new(tls))
    }

    fn describe(&self) -> String {
        format!("tls://{}", self.tcp.address)
    }
}

/// Either connector, chosen at startup.
#[derive(Clone)]
pub enum BridgeConnector {
    Tcp(TcpConnector),
    Tls(TlsConnector),
}

impl BridgeConnector {
    pub fn from_endpoint(endpoint: &BridgeEndpoint) -> Result<Self, TlsConfigError> {
        Ok(match &endpoint.tls {
            None => Self::Tcp(TcpConnector::new(endpoint.address())),
            Some(trust) => Self::Tls(TlsConnector::new(
                endpoint.address(),
                endpoint.server_name(),
                trust,
            )?),
        })
    }
}

impl Connector for BridgeConnector {
    async fn connect(&self) -> Result<BoxedIo, TunnelError> {
        match self {
            Self::Tcp(c) => c.connect().await,
            Self::Tls(c) => c.connect().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Tcp(c) => c.describe(),
            Self::Tls(c) => c.describe(),
        }
    }
}

fn client_config(trust: &TlsTrust) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;

    let config = match trust {
        TlsTrust::CustomCa(path) => builder
            .with_root_certificates(load_roots(path)?)
            .with_no_client_auth(),
        TlsTrust::InsecureSkipVerify => {
            warn!("TLS certificate verification is DISABLED for the tunnel connection");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        }
    };
    Ok(Arc::new(config))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsConfigError> {
    let pem = std::fs::read(path)
        .map_err(|e| TlsConfigError::FileRead(format!("Failed to read {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| TlsConfigError::InvalidPem(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TlsConfigError::InvalidPem(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TlsConfigError::InvalidPem(format!("{}: {e}", path.display())))?;
    }
    Ok(roots)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS client configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("File read error: {0}")]
    FileRead(String),

    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(String),
}
