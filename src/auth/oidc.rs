//! OIDC/JWKS validator with a background key-set poller.
//!
//! The poller task runs for the process lifetime: every interval it walks
//! `<issuer>/.well-known/openid-configuration` → `jwks_uri` → key set and
//! atomically replaces the in-memory snapshot. Fetch failures are logged and
//! retried on the next tick; requests arriving before the first successful
//! poll fail 401 because there are no keys to verify against.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::auth::jwks::{Jwks, KeySet};
use crate::auth::{bearer_token, AuthError};
use crate::config::OidcOptions;
use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::proxy::RequestContext;

/// OpenID Connect discovery document; only `jwks_uri` is consumed.
#[derive(Debug, Deserialize)]
struct OpenIdConfiguration {
    jwks_uri: String,
}

/// Verifies client JWTs against the issuer's published JWKS.
pub struct OidcValidator {
    issuer_url: String,
    username_claim: String,
    poll_interval: Duration,
    keys: KeySet,
    http: reqwest::Client,
    validation: Validation,
}

impl OidcValidator {
    pub fn new(options: &OidcOptions) -> Result<Self, AuthError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(options.insecure_skip_verify);

        if let Some(ca_file) = &options.ca_file {
            let pem = std::fs::read(ca_file).map_err(AuthError::ReadKey)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(AuthError::Client)?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            issuer_url: options.issuer_url.trim_end_matches('/').to_string(),
            username_claim: options.username_claim.clone(),
            poll_interval: options.poll_interval,
            keys: KeySet::new(),
            http: builder.build().map_err(AuthError::Client)?,
            validation: Validation::new(Algorithm::RS256),
        })
    }

    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    /// Spawn the background poll loop. The task never exits on its own; a
    /// failed poll flips the provider-up gauge to 0 and the loop carries on.
    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let validator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(validator.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match validator.refresh().await {
                    Ok(count) => {
                        metrics::record_oidc_provider_up(&validator.issuer_url, true);
                        tracing::trace!(
                            issuer = %validator.issuer_url,
                            keys = count,
                            "JWKS refreshed"
                        );
                    }
                    Err(e) => {
                        metrics::record_oidc_provider_up(&validator.issuer_url, false);
                        tracing::warn!(
                            issuer = %validator.issuer_url,
                            error = %e,
                            "failed to refresh JWKS, will retry"
                        );
                    }
                }
            }
        })
    }

    /// Run discovery once and swap in the fetched key set.
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let discovery_url = format!("{}/.well-known/openid-configuration", self.issuer_url);
        let config: OpenIdConfiguration = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(AuthError::Discovery)?
            .json()
            .await
            .map_err(AuthError::Discovery)?;

        let jwks: Jwks = self
            .http
            .get(&config.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(AuthError::Keys)?
            .json()
            .await
            .map_err(AuthError::Keys)?;

        let count = jwks.keys.len();
        self.keys.store(jwks);
        Ok(count)
    }

    /// Verify the signature against the current snapshot and return the
    /// subject named by the configured username claim.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let header = jsonwebtoken::decode_header(token).map_err(AuthError::Malformed)?;
        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;

        // One snapshot per request; a concurrent swap does not affect us.
        let snapshot = self.keys.load();
        let jwk = snapshot.find(&kid).ok_or(AuthError::KeyIdInvalid)?;
        let key = jwk.decoding_key()?;

        let data = jsonwebtoken::decode::<serde_json::Value>(token, &key, &self.validation)
            .map_err(AuthError::Verification)?;

        Ok(data
            .claims
            .get(&self.username_claim)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// Test and bootstrap hook: install a key set without polling.
    pub fn set_keys(&self, jwks: Jwks) {
        self.keys.store(jwks);
    }
}

/// Middleware wrapping [`OidcValidator::verify`].
pub async fn validate(
    State(validator): State<Arc<OidcValidator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let context = req
        .extensions()
        .get::<RequestContext>()
        .map(|c| c.context.clone())
        .unwrap_or_default();
    metrics::record_auth_attempt("oidc", &context);

    let token = bearer_token(req.headers())
        .ok_or_else(|| ProxyError::unauthorized(AuthError::NoToken))?;

    match validator.verify(token) {
        Ok(subject) => {
            metrics::record_auth_outcome("oidc", &context, true);
            if let Some(rc) = req.extensions_mut().get_mut::<RequestContext>() {
                rc.subject = subject;
            }
            Ok(next.run(req).await)
        }
        Err(e) => {
            metrics::record_auth_outcome("oidc", &context, false);
            Err(ProxyError::unauthorized(e))
        }
    }
}
