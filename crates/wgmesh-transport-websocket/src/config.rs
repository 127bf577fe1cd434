//! WebSocket transport configuration

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use wgmesh_transport::{TransportError, TransportResult};

/// Listener-side WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Upgrade path (e.g., "/ws")
    pub path: String,

    /// PEM certificate chain; with `tls_key_path` enables `wss://`
    pub tls_cert_path: Option<PathBuf>,

    /// PEM private key
    pub tls_key_path: Option<PathBuf>,

    /// Upper bound on TLS + upgrade handshake per connection
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConfig {
    /// Plain `ws://` listener on the given path
    pub fn plain(path: &str) -> Self {
        Self::default().with_path(path)
    }

    /// Set WebSocket path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Serve `wss://` with the given certificate and key
    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls_cert_path = Some(cert_path.into());
        self.tls_key_path = Some(key_path.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls_enabled() {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(
                "WebSocket path must start with '/'".to_string(),
            ));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(TransportError::ConfigurationError(
                "TLS requires both a certificate and a private key".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether an upgrade request path targets this listener
    pub fn matches_path(&self, path: &str) -> bool {
        path == self.path || path.strip_suffix('/') == Some(self.path.as_str())
    }

    /// Build rustls TlsAcceptor when TLS is configured
    pub(crate) fn build_tls_acceptor(&self) -> TransportResult<Option<tokio_rustls::TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert_path, &self.tls_key_path) else {
            return Ok(None);
        };

        ensure_crypto_provider();

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto))))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WebSocketConfig::default();
        assert_eq!(config.path, "/ws");
        assert!(!config.tls_enabled());
        assert_eq!(config.scheme(), "ws");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_path_validation() {
        let config = WebSocketConfig::plain("invalid");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_requires_both_paths() {
        let mut config = WebSocketConfig::default().with_tls("cert.pem", "key.pem");
        assert!(config.validate().is_ok());
        assert_eq!(config.scheme(), "wss");

        config.tls_key_path = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_matches_path() {
        let config = WebSocketConfig::plain("/ws");
        assert!(config.matches_path("/ws"));
        assert!(config.matches_path("/ws/"));
        assert!(!config.matches_path("/"));
        assert!(!config.matches_path("/wsx"));
    }

    #[test]
    fn test_missing_cert_file() {
        let config = WebSocketConfig::default()
            .with_tls("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(
            config.build_tls_acceptor(),
            Err(TransportError::TlsError(_))
        ));
    }
}
