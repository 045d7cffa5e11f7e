//! Inbound TLS termination.
//!
//! Loads a PEM certificate chain and private key into a rustls
//! `ServerConfig` (TLS 1.2+, no client authentication) for the listener's
//! `tokio-rustls` acceptor.

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),
    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),
    #[error("building TLS config: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Load a certificate/key pair into a server-side rustls config.
pub fn load_server_config(cert_file: &Path, key_file: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    // Pin the process-default crypto provider so the builder below is
    // deterministic even when another dependency enables a second provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = std::fs::read(path).map_err(|e| TlsError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = std::fs::read(path).map_err(|e| TlsError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TlsError::Io {
            path: path.display().to_string(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}
