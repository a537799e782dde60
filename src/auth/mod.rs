//! Client authentication: bearer token parsing and the two JWT validators.
//!
//! Both validators verify RS256 signatures and resolve the subject that the
//! proxy will impersonate upstream. They differ only in where the public key
//! comes from: a preconfigured PEM file (`rs256`) or a polled OIDC provider
//! (`oidc`). Exactly one of the two is active in a deployment.

pub mod jwks;
pub mod jwt;
pub mod oidc;
pub mod rs256;

use http::HeaderMap;
use thiserror::Error;

pub use jwks::{Jwk, Jwks, KeySet};
pub use oidc::OidcValidator;
pub use rs256::Rs256Validator;

/// Errors produced while authenticating a request or configuring a
/// validator. Request-path variants map to 401 at the pipeline boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token in request")]
    NoToken,

    #[error("malformed token: {0}")]
    Malformed(jsonwebtoken::errors::Error),

    #[error("verification error: {0}")]
    Verification(jsonwebtoken::errors::Error),

    #[error("token has no key id")]
    MissingKeyId,

    #[error("key id invalid")]
    KeyIdInvalid,

    #[error("invalid key type, expected 'RSA' got '{0}'")]
    KeyType(String),

    #[error("expected e to be one of 'AQAB' and 'AAEAAQ' but got '{0}'")]
    Exponent(String),

    #[error("failed to read public key: {0}")]
    ReadKey(std::io::Error),

    #[error("invalid RS256 public key: {0}")]
    InvalidKey(jsonwebtoken::errors::Error),

    #[error("failed to build OIDC client: {0}")]
    Client(reqwest::Error),

    #[error("openid-configuration fetch failed: {0}")]
    Discovery(reqwest::Error),

    #[error("JWKS fetch failed: {0}")]
    Keys(reqwest::Error),
}

/// Extract the JWT from an `Authorization: Bearer <token>` header.
///
/// The scheme match is case-insensitive. Returns `None` for a missing header,
/// a non-bearer scheme, or an empty token.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    if value.len() > 7 && value[..7].eq_ignore_ascii_case("bearer ") {
        let token = value[7..].trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}
