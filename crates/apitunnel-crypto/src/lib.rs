//! apitunnel PSK primitives
//!
//! The tunnel is authenticated by a pre-shared key that never crosses the
//! wire. Each side derives a fixed 32-byte proof from it:
//!
//! - **Proof**: HKDF-SHA256(PSK, salt, info) → 32 bytes
//! - **Verification**: constant-time comparison of presented vs expected
//!
//! The proof is static per PSK, so it is replayable by anyone who can read
//! it. Confidentiality of the surrounding TLS transport is a precondition.

#[cfg(feature = "certs")]
pub mod certs;
pub mod error;
pub mod psk;

pub use error::CryptoError;
pub use psk::{PskCredential, Verdict, constant_time_eq};
