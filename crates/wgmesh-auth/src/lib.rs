//! Key material and credentials for mesh peers
//!
//! WireGuard keypairs are X25519 keys exchanged as standard base64. Peer
//! credentials are opaque bearer strings carrying a role prefix.

pub mod keys;
pub mod token;

pub use keys::{derive_public_key, generate_keypair, validate_key, KeyError, KeyPair};
pub use token::{CredentialKind, Token, TokenError, TokenGenerator};
