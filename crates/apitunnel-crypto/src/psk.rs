//! Pre-shared key credential and proof verification.

use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// HKDF salt for domain separation of the connection proof.
const PROOF_SALT: &[u8] = b"apitunnel-psk-proof-v1";

/// HKDF info string for the connection proof.
const PROOF_INFO: &[u8] = b"connection-proof";

/// Proof length in bytes. Mirrors `apitunnel_proto::handshake::PROOF_LEN`.
pub const PROOF_LEN: usize = 32;

/// Outcome of checking a presented proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Authenticated,
    Rejected,
}

/// The shared secret. Zeroized on drop and redacted from `Debug`.
#[derive(Clone)]
pub struct PskCredential {
    secret: Zeroizing<Vec<u8>>,
    proof: [u8; PROOF_LEN],
}

impl PskCredential {
    /// Build a credential from the raw secret and derive its proof once.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let secret = Zeroizing::new(secret.into());
        if secret.is_empty() {
            return Err(CryptoError::EmptyKey);
        }
        let proof = derive_proof(&secret)?;
        Ok(Self { secret, proof })
    }

    /// The bytes the connecting side presents as its first write.
    pub const fn proof(&self) -> &[u8; PROOF_LEN] {
        &self.proof
    }

    /// Check a presented proof. Runs in time independent of where (or
    /// whether) the bytes differ; a wrong length is rejected outright.
    pub fn verify(&self, presented: &[u8]) -> Verdict {
        if constant_time_eq(presented, &self.proof) {
            Verdict::Authenticated
        } else {
            Verdict::Rejected
        }
    }

    /// Short hex prefix of the proof, safe to log for correlating peers.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.proof[..4])
    }

    pub fn secret_len(&self) -> usize {
        self.secret.len()
    }
}

impl std::fmt::Debug for PskCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskCredential")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl Drop for PskCredential {
    fn drop(&mut self) {
        self.proof.zeroize();
    }
}

fn derive_proof(secret: &[u8]) -> Result<[u8; PROOF_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(PROOF_SALT), secret);
    let mut proof = [0u8; PROOF_LEN];
    hk.expand(PROOF_INFO, &mut proof)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(proof)
}

/// Constant-time byte comparison. Unequal lengths compare false without
/// inspecting contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
