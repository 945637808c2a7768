//! Peer-identity signing. Detached ed25519 sign/verify, the signing primitive the protocol
//! treats as an external collaborator (§1) — this module is a thin, typed wrapper over
//! `ed25519-dalek`, in the same spirit as this lineage's `flux::crypto` wrapper over libsodium.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a fresh keypair from a cryptographically secure RNG. Used whenever a Context
    /// has no configured identity keypair and a new connection needs one.
    pub fn generate<R: RngCore + rand::CryptoRng>(rng: &mut R) -> KeyPair {
        KeyPair {
            signing_key: SigningKey::generate(rng),
        }
    }

    #[inline]
    pub fn from_secret(secret: &[u8; SECRET_KEY_SIZE]) -> KeyPair {
        KeyPair {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    #[inline]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    #[inline]
    pub fn secret_key(&self) -> [u8; SECRET_KEY_SIZE] {
        self.signing_key.to_bytes()
    }

    /// Produces a detached signature over `message`.
    #[inline]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verifies a detached signature against a raw 32-byte public key. Returns `false` on any
/// malformed key or signature rather than propagating a crypto-library error type, since the
/// only thing the caller can do with either is drop the packet.
#[inline]
pub fn verify(public_key: &[u8; PUBLIC_KEY_SIZE], message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig).is_ok()
}
