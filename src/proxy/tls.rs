//! Upstream TLS client configuration, built once per context.

use std::sync::{Arc, Once};

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

use crate::config::catalog::UpstreamContext;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read TLS material: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid certificate in bundle: {0}")]
    BadCertificate(rustls::Error),

    #[error("no private key found in client key PEM")]
    NoPrivateKey,

    #[error("invalid client certificate/key pair: {0}")]
    BadKeyPair(rustls::Error),
}

/// Build the immutable TLS client configuration for one upstream.
///
/// Root trust comes from the context's CA bundle when one is configured,
/// otherwise from the platform store. The client certificate pair is loaded
/// when both halves are present. `insecure_skip_verify` swaps in a verifier
/// that accepts anything.
static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

pub fn client_config(upstream: &UpstreamContext) -> Result<ClientConfig, TlsError> {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let mut roots = RootCertStore::empty();
    match &upstream.ca {
        Some(source) => {
            let pem = source.read()?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(cert?).map_err(TlsError::BadCertificate)?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().certs {
                // Individual unparsable platform certs are skipped, same as
                // every other rustls consumer.
                let _ = roots.add(cert);
            }
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);

    let mut config = match (&upstream.client_cert, &upstream.client_key) {
        (Some(cert_source), Some(key_source)) => {
            let cert_pem = cert_source.read()?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<Result<Vec<_>, _>>()?;
            let key_pem = key_source.read()?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
                .ok_or(TlsError::NoPrivateKey)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(TlsError::BadKeyPair)?
        }
        _ => builder.with_no_client_auth(),
    };

    if upstream.insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify));
    }

    Ok(config)
}

/// Disable certificate verification on an already-built configuration.
///
/// Used by the proxied tunnel, which layers TLS over an HTTP CONNECT stream
/// where the usual SNI/verification surface does not apply. Callers clone the
/// shared config first; the per-context configuration is never mutated.
pub fn disable_verification(config: &mut ClientConfig) {
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoVerify));
}

/// Certificate verifier that accepts any chain.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
