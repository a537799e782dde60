//! Request-path error taxonomy.
//!
//! Middlewares and the handler return `Err(ProxyError)` instead of writing
//! into the response themselves; this type decides the status code and body
//! shape in one place.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{header, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::proxy::tls::TlsError;
use crate::proxy::transport::TransportError;
use crate::proxy::tunnel::TunnelError;

/// Fixed body for routing failures.
pub const CONTEXT_NOT_FOUND: &str = "no route: context not found";

/// Fixed body when the client connection cannot be taken over for tunneling.
pub const HIJACK_UNSUPPORTED: &str = "Hijacking not supported";

#[derive(Debug, Error)]
pub enum ProxyError {
    /// No context resolved, or the resolved name has no upstream.
    #[error("{}", CONTEXT_NOT_FOUND)]
    ContextNotFound,

    /// Authentication failed; carries the validator error strings.
    #[error("unauthorized: {}", .0.join(", "))]
    Unauthorized(Vec<String>),

    /// The upstream TLS client configuration could not be built.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The upstream round-trip failed.
    #[error(transparent)]
    Upstream(#[from] TransportError),

    /// The tunnel could not be established.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The server stack did not hand us an upgradable connection.
    #[error("{}", HIJACK_UNSUPPORTED)]
    HijackUnsupported,
}

impl ProxyError {
    pub fn unauthorized(err: AuthError) -> Self {
        Self::Unauthorized(vec![err.to_string()])
    }

    fn status(&self) -> StatusCode {
        match self {
            ProxyError::ContextNotFound => StatusCode::BAD_GATEWAY,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Tls(_)
            | ProxyError::Upstream(_)
            | ProxyError::Tunnel(_)
            | ProxyError::HijackUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body returned for validation failures.
#[derive(Debug, Serialize)]
struct ErrorBody {
    status: u16,
    errors: Vec<String>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ProxyError::Unauthorized(errors) => {
                let body = serde_json::to_string(&ErrorBody {
                    status: status.as_u16(),
                    errors,
                })
                .unwrap_or_default();
                Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap_or_else(|_| status.into_response())
            }
            ProxyError::ContextNotFound => (status, CONTEXT_NOT_FOUND).into_response(),
            ProxyError::HijackUnsupported => (status, HIJACK_UNSUPPORTED).into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}
