//! RS256 validator backed by a preconfigured RSA public key.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use rand::Rng;

use crate::auth::{bearer_token, AuthError};
use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::proxy::RequestContext;

const SUBJECT_CLAIM: &str = "sub";

/// Verifies client JWT signatures against a fixed RSA public key.
pub struct Rs256Validator {
    key: DecodingKey,
    validation: Validation,
}

impl Rs256Validator {
    /// Build a validator from PEM-encoded public key bytes.
    pub fn from_pem(pem: &[u8]) -> Result<Self, AuthError> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(AuthError::InvalidKey)?;
        Ok(Self {
            key,
            validation: Validation::new(Algorithm::RS256),
        })
    }

    /// Build a validator from a PEM file on disk.
    pub fn from_pem_file(path: &Path) -> Result<Self, AuthError> {
        let pem = std::fs::read(path).map_err(AuthError::ReadKey)?;
        Self::from_pem(&pem)
    }

    /// Verify the signature and return the subject to impersonate.
    ///
    /// A token without a usable `sub` claim is still accepted, but the
    /// subject is replaced with a random identifier: the Kubernetes API
    /// ignores impersonation headers with an empty value, which would
    /// silently fall back to the proxy's own identity.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = jsonwebtoken::decode::<serde_json::Value>(token, &self.key, &self.validation)
            .map_err(AuthError::Verification)?;

        let subject = data
            .claims
            .get(SUBJECT_CLAIM)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| random_subject(10));

        Ok(subject)
    }
}

/// Middleware wrapping [`Rs256Validator::verify`].
pub async fn validate(
    State(validator): State<Arc<Rs256Validator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let context = req
        .extensions()
        .get::<RequestContext>()
        .map(|c| c.context.clone())
        .unwrap_or_default();
    metrics::record_auth_attempt("rs256", &context);

    let token = bearer_token(req.headers())
        .ok_or_else(|| ProxyError::unauthorized(AuthError::NoToken))?;

    match validator.verify(token) {
        Ok(subject) => {
            metrics::record_auth_outcome("rs256", &context, true);
            if let Some(rc) = req.extensions_mut().get_mut::<RequestContext>() {
                rc.subject = subject;
            }
            Ok(next.run(req).await)
        }
        Err(e) => {
            metrics::record_auth_outcome("rs256", &context, false);
            Err(ProxyError::unauthorized(e))
        }
    }
}

/// Fixed-length random ASCII letter string.
fn random_subject(n: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}
