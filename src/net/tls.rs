//! TLS configuration and certificate loading.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid TLS material: {0}")]
    Material(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<std::fs::File>, TlsError> {
    std::fs::File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })
}

/// Load PEM certificate chain and private key and build an acceptor.
///
/// ALPN offers h2 ahead of http/1.1 when HTTP/2 is enabled, so the
/// handshake decides which sub-server the connection reaches.
pub fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
    offer_h2: bool,
) -> Result<TlsAcceptor, TlsError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Read {
            path: cert_path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.display().to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| TlsError::Read {
            path: key_path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.display().to_string()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = if offer_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    tracing::info!(
        cert = %cert_path.display(),
        alpn_h2 = offer_h2,
        "TLS material loaded"
    );

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_fail_fast() {
        let err = load_tls_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            true,
        )
        .err()
        .unwrap();
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[test]
    fn empty_pem_is_rejected() {
        let dir = std::env::temp_dir();
        let cert = dir.join("polyserve-test-empty-cert.pem");
        let key = dir.join("polyserve-test-empty-key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();

        let err = load_tls_config(&cert, &key, true).err().unwrap();
        assert!(matches!(err, TlsError::NoCertificates(_)));

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }
}
