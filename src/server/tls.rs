//! TLS termination for the client-facing listener.
//!
//! Uses rustls throughout; certificate and key are loaded once at startup.
//! When a client CA bundle is configured the listener requires and verifies
//! client certificates (mutual TLS).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerTlsError {
    #[error("failed to read TLS material: {0}")]
    Read(#[from] std::io::Error),

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in key file")]
    NoPrivateKey,

    #[error("invalid certificate/key pair: {0}")]
    BadKeyPair(rustls::Error),

    #[error("invalid client CA bundle: {0}")]
    BadClientCa(rustls::Error),

    #[error("failed to build client verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}

/// Build the listener's TLS configuration.
pub fn server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> Result<ServerConfig, ServerTlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerTlsError::NoCertificates(
            cert_path.display().to_string(),
        ));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or(ServerTlsError::NoPrivateKey)?;

    let builder = ServerConfig::builder();
    let mut config = match client_ca {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(ca_path)?)) {
                roots.add(cert?).map_err(ServerTlsError::BadClientCa)?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(ServerTlsError::BadKeyPair)?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
