//! Peer credential generation

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Random bytes behind every credential
const CREDENTIAL_BYTES: usize = 32;

/// Opaque bearer credential
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}

/// Which kind of peer a credential belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Agent,
    Gateway,
}

impl CredentialKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            CredentialKind::Agent => "agt",
            CredentialKind::Gateway => "gw",
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid token format")]
    InvalidFormat,

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

pub struct TokenGenerator;

impl TokenGenerator {
    /// Generate a random token
    pub fn generate() -> Token {
        let mut bytes = [0u8; CREDENTIAL_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Token(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Generate a token with prefix
    pub fn generate_with_prefix(prefix: &str) -> Token {
        let token = Self::generate();
        Token(format!("{}_{}", prefix, token.0))
    }

    /// Generate a credential for an agent or gateway (`agt_...` / `gw_...`)
    pub fn generate_credential(kind: CredentialKind) -> Token {
        Self::generate_with_prefix(kind.prefix())
    }

    /// Validate token format (basic check)
    pub fn validate_format(token: &Token) -> Result<(), TokenError> {
        if token.0.is_empty() {
            return Err(TokenError::InvalidFormat);
        }

        let token_str = [CredentialKind::Agent, CredentialKind::Gateway]
            .iter()
            .find_map(|kind| {
                token
                    .0
                    .strip_prefix(kind.prefix())
                    .and_then(|rest| rest.strip_prefix('_'))
            })
            .unwrap_or(token.0.as_str());

        if token_str.is_empty() {
            return Err(TokenError::InvalidFormat);
        }

        URL_SAFE_NO_PAD
            .decode(token_str)
            .map_err(TokenError::Base64Error)?;

        Ok(())
    }
}
