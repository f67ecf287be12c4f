//! PSK handshake on a freshly established connection.
//!
//! The connecting side writes its 32-byte proof; the accepting side
//! compares it in constant time and answers with a single status byte.
//! Nothing else may be read or written before this completes, and the
//! only way to obtain an [`Authenticated`] connection is through one of
//! the two functions here.

use std::time::Duration;

use apitunnel_crypto::{PskCredential, Verdict};
use apitunnel_proto::handshake::{PROOF_LEN, STATUS_ACCEPTED, STATUS_REJECTED};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

/// A connection that has passed the PSK exchange.
#[derive(Debug)]
pub struct Authenticated<S> {
    io: S,
}

impl<S> Authenticated<S> {
    pub fn into_inner(self) -> S {
        self.io
    }

    pub const fn get_ref(&self) -> &S {
        &self.io
    }
}

/// Connecting side: present the proof and wait for the verdict.
pub async fn present_proof<S>(
    mut io: S,
    psk: &PskCredential,
    timeout: Duration,
) -> Result<Authenticated<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let status = tokio::time::timeout(timeout, exchange_proof(&mut io, psk))
        .await
        .map_err(|_| TunnelError::Authentication("handshake timed out".into()))??;

    match status {
        STATUS_ACCEPTED => {
            debug!(fingerprint = %psk.fingerprint(), "Handshake accepted");
            Ok(Authenticated { io })
        }
        other => Err(TunnelError::Authentication(format!(
            "peer rejected the pre-shared key (status {other})"
        ))),
    }
}

async fn exchange_proof<S>(io: &mut S, psk: &PskCredential) -> Result<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(psk.proof()).await?;
    io.flush().await?;
    let mut status = [0u8; 1];
    match io.read_exact(&mut status).await {
        Ok(_) => Ok(status[0]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            TunnelError::Authentication("peer closed the connection during handshake".into()),
        ),
        Err(e) => Err(TunnelError::from(e)),
    }
}

/// Accepting side: read and check the peer's proof, then answer it.
///
/// A mismatch is answered with a rejection byte and the write half is
/// shut down before the error is returned.
pub async fn verify_proof<S>(
    mut io: S,
    psk: &PskCredential,
    timeout: Duration,
) -> Result<Authenticated<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut presented = [0u8; PROOF_LEN];
    let read = tokio::time::timeout(timeout, io.read_exact(&mut presented)).await;
    match read {
        Err(_) => {
            return Err(TunnelError::Authentication(
                "no proof presented within handshake timeout".into(),
            ));
        }
        Ok(Err(e)) => {
            return Err(TunnelError::Authentication(format!(
                "failed to read proof: {e}"
            )));
        }
        Ok(Ok(_)) => {}
    }

    match psk.verify(&presented) {
        Verdict::Authenticated => {
            tokio::time::timeout(timeout, async {
                io.write_all(&[STATUS_ACCEPTED]).await?;
                io.flush().await
            })
            .await
            .map_err(|_| TunnelError::Authentication("handshake timed out".into()))??;
            Ok(Authenticated { io })
        }
        Verdict::Rejected => {
            warn!("Rejecting tunnel connection: proof mismatch");
            let _ = tokio::time::timeout(timeout, async {
                io.write_all(&[STATUS_REJECTED]).await?;
                io.flush().await?;
                io.shutdown().await
            })
            .await;
            Err(TunnelError::Authentication("proof mismatch".into()))
        }
    }
}
