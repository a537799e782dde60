//! JSON Web Key Set types and the atomically-swapped snapshot store.

use arc_swap::ArcSwap;
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AuthError;

/// A JSON Web Key Set as served by an OIDC provider's `jwks_uri`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    #[serde(default)]
    pub keys: Vec<Jwk>,
}

/// A single JSON Web Key. Only RSA signing keys are supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub kid: String,
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub e: String,
    #[serde(default)]
    pub x5c: Vec<String>,
}

impl Jwks {
    /// Find a key by its key id.
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

impl Jwk {
    /// Reconstruct an RS256 verification key from the JWK parameters.
    ///
    /// Requires `kty=RSA` and an exponent encoding 65537 (`AQAB` or its
    /// padded form `AAEAAQ`); anything else is rejected before touching the
    /// modulus.
    pub fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        if self.kty != "RSA" {
            return Err(AuthError::KeyType(self.kty.clone()));
        }
        if self.e != "AQAB" && self.e != "AAEAAQ" {
            return Err(AuthError::Exponent(self.e.clone()));
        }
        DecodingKey::from_rsa_components(&self.n, &self.e).map_err(AuthError::InvalidKey)
    }
}

/// Lock-free JWKS snapshot.
///
/// The poller swaps in whole key sets; request handlers load the current
/// snapshot once and keep using that local value for the rest of the request,
/// so a concurrent swap never changes which keys a request sees.
#[derive(Debug, Default)]
pub struct KeySet {
    inner: ArcSwap<Jwks>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<Jwks> {
        self.inner.load_full()
    }

    /// Replace the snapshot atomically.
    pub fn store(&self, jwks: Jwks) {
        self.inner.store(Arc::new(jwks));
    }
}
