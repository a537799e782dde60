//! Bearer token presence / well-formedness middleware.
//!
//! Runs before the signature validators and rejects requests that carry no
//! token or a token that does not even parse as a JWT, so the validators only
//! ever see structurally sound input.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::{bearer_token, AuthError};
use crate::proxy::error::ProxyError;

pub async fn require_bearer(req: Request, next: Next) -> Result<Response, ProxyError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| ProxyError::unauthorized(AuthError::NoToken))?;

    jsonwebtoken::decode_header(token)
        .map_err(|e| ProxyError::unauthorized(AuthError::Malformed(e)))?;

    Ok(next.run(req).await)
}
