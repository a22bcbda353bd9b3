//! The mesh handshake, as specified in the spec's design notes (resolving an
//! ambiguity left open by the source this was ported from):
//!
//! `proof = HMAC-SHA256(shared_secret, "atmosphere-handshake-v1" || peer_id || nonce)`
//!
//! The dialer sends `{peer_id, nonce}`; the listener replies `{peer_id, proof}`
//! computed over the dialer's nonce; the dialer verifies it, then replies with
//! its own proof over a nonce the listener sent back. Either side that fails
//! verification closes the connection and reports `AuthRejected` without
//! tearing down the node.

use atmosphere_types::{PeerId, HANDSHAKE_DOMAIN};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeProof(pub [u8; 32]);

#[derive(Debug, thiserror::Error, Clone, Copy)]
pub enum HandshakeError {
    #[error("mesh secret mismatch: handshake proof did not verify")]
    AuthRejected,
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Computes the HMAC proof a peer sends to demonstrate knowledge of the
/// mesh's shared secret without ever transmitting the secret itself.
pub fn compute_proof(shared_secret: &[u8; 32], peer_id: PeerId, nonce: &[u8]) -> HandshakeProof {
    let mut mac = HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts any key length");
    mac.update(HANDSHAKE_DOMAIN);
    mac.update(peer_id.as_bytes());
    mac.update(nonce);
    let bytes = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    HandshakeProof(out)
}

/// Verifies a proof in constant time; any mismatch -- including the peer
/// simply being on a different mesh -- yields the same `AuthRejected`.
pub fn verify_proof(
    shared_secret: &[u8; 32],
    claimed_peer_id: PeerId,
    nonce: &[u8],
    proof: &HandshakeProof,
) -> Result<(), HandshakeError> {
    let expected = compute_proof(shared_secret, claimed_peer_id, nonce);
    if expected.0.ct_eq(&proof.0).into() {
        Ok(())
    } else {
        Err(HandshakeError::AuthRejected)
    }
}
