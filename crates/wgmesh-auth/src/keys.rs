//! WireGuard (X25519) key generation and validation

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a raw X25519 key
pub const KEY_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// A base64-encoded WireGuard keypair
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a fresh keypair from the OS random source.
///
/// The private scalar is clamped before encoding so the stored value is
/// exactly what WireGuard itself would use.
pub fn generate_keypair() -> KeyPair {
    let mut bytes = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    clamp(&mut bytes);

    let public = public_from_bytes(bytes);
    KeyPair {
        private_key: STANDARD.encode(bytes),
        public_key: STANDARD.encode(public),
    }
}

/// Compute the public key for a base64 private key
pub fn derive_public_key(private_key: &str) -> Result<String, KeyError> {
    let bytes = decode_key(private_key)?;
    Ok(STANDARD.encode(public_from_bytes(bytes)))
}

/// Check that a string is base64 for exactly 32 bytes
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    decode_key(key).map(|_| ())
}

fn decode_key(key: &str) -> Result<[u8; KEY_LENGTH], KeyError> {
    let decoded = STANDARD.decode(key.trim())?;
    if decoded.len() != KEY_LENGTH {
        return Err(KeyError::InvalidLength(decoded.len()));
    }
    let mut bytes = [0u8; KEY_LENGTH];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

fn clamp(bytes: &mut [u8; KEY_LENGTH]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

fn public_from_bytes(bytes: [u8; KEY_LENGTH]) -> [u8; KEY_LENGTH] {
    let secret = StaticSecret::from(bytes);
    *PublicKey::from(&secret).as_bytes()
}
