//! Development CA and server certificate generation.
//!
//! Used by the Bridge's dev TLS mode to mint a throwaway CA and a server
//! certificate for the tunnel listener. The Offramp is pointed at the CA
//! with `--ca-cert`. Not for production use.
//!
//! Requires the `certs` feature to be enabled.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};

use crate::error::CryptoError;

/// CA material for signing server certificates.
pub struct CaBundle {
    /// CA certificate parameters (needed for signing).
    pub params: CertificateParams,
    /// CA key pair.
    pub key_pair: KeyPair,
    /// PEM-encoded CA certificate.
    pub ca_cert_pem: String,
}

/// Generate a self-signed CA.
pub fn generate_ca(org_name: &str) -> Result<CaBundle, CryptoError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let key_pair = KeyPair::generate().map_err(|e| CryptoError::CertGeneration(e.to_string()))?;
    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        params,
        key_pair,
    })
}

/// Generate a server certificate for `server_names` signed by `ca`.
///
/// Returns `(cert_pem, key_pem)`.
pub fn generate_server_cert(
    ca: &CaBundle,
    server_names: &[&str],
) -> Result<(String, String), CryptoError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::new(
        server_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    )
    .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;

    params
        .distinguished_name
        .push(DnType::CommonName, "apitunnel Bridge");
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let server_key =
        KeyPair::generate().map_err(|e| CryptoError::CertGeneration(e.to_string()))?;
    let server_cert = params
        .signed_by(&server_key, &issuer)
        .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;

    Ok((server_cert.pem(), server_key.serialize_pem()))
}
