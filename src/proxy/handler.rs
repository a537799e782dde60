//! The terminal pipeline stage: request rewriting and upstream dispatch.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::Response;
use http::header::{HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Scheme, Uri};
use http::header;

use crate::proxy::error::ProxyError;
use crate::proxy::transport::TransportError;
use crate::proxy::{tunnel, ProxyService, RequestContext};

/// Kubernetes impersonation header carrying the authenticated subject.
pub static IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");

static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Proxy a client request to the upstream selected by the middleware chain.
///
/// Preconditions established by the pipeline: `RequestContext.context` and
/// `.subject` are both non-empty (401/502 otherwise). Requests carrying an
/// `Upgrade` header divert to the tunnel flow; everything else is rewritten
/// and round-tripped through the per-context transport.
pub async fn proxy_handler(
    State(service): State<Arc<ProxyService>>,
    req: Request,
) -> Result<Response, ProxyError> {
    let rc = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    if rc.context.is_empty() || rc.subject.is_empty() {
        return Err(ProxyError::ContextNotFound);
    }

    let upstream = service
        .catalog()
        .get(&rc.context)
        .ok_or(ProxyError::ContextNotFound)?;
    let transport = service.transport_for(&upstream)?;

    if req.headers().contains_key(header::UPGRADE) {
        return tunnel::tunnel(&service, &upstream, &transport, &rc, req).await;
    }

    let client_host = req.headers().get(header::HOST).cloned().or_else(|| {
        req.uri()
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    });

    let (mut parts, body) = req.into_parts();
    parts.uri = upstream_uri(&upstream.server, &parts.uri)?;

    // The client's own credentials never reach the upstream: the bearer token
    // is swapped for the context's (even when the context has none) and the
    // identity travels via impersonation.
    let subject = HeaderValue::from_str(&rc.subject)
        .map_err(|_| ProxyError::Unauthorized(vec!["subject is not a valid header value".to_string()]))?;
    parts.headers.insert(IMPERSONATE_USER.clone(), subject);
    let token = upstream.token.as_deref().unwrap_or("");
    let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
        TransportError::InvalidUrl("upstream token is not a valid header value".to_string())
    })?;
    parts.headers.insert(header::AUTHORIZATION, bearer);
    parts.headers.remove(header::HOST);
    if let Some(host) = client_host {
        parts.headers.insert(X_FORWARDED_HOST.clone(), host);
    }

    let upstream_response = transport
        .round_trip(Request::from_parts(parts, body))
        .await?;

    // All upstream headers ride along unchanged, duplicates included; the
    // body streams through hyper frame by frame.
    let mut response = upstream_response;
    response.extensions_mut().insert(rc);
    Ok(response)
}

/// Graft the upstream scheme and authority onto the client's (already
/// context-stripped) path and query.
fn upstream_uri(server: &str, original: &Uri) -> Result<Uri, TransportError> {
    let parsed: Uri = server
        .parse()
        .map_err(|e| TransportError::InvalidUrl(format!("{server}: {e}")))?;
    let server_parts = parsed.into_parts();
    if server_parts.authority.is_none() {
        return Err(TransportError::InvalidUrl(format!(
            "upstream server URL '{server}' has no host"
        )));
    }

    let mut parts = original.clone().into_parts();
    parts.scheme = server_parts.scheme.or(Some(Scheme::HTTPS));
    parts.authority = server_parts.authority;
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|e| TransportError::InvalidUrl(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_uri_replaces_scheme_and_authority_only() {
        let original: Uri = "/api/v1/pods?limit=500".parse().unwrap();
        let rewritten = upstream_uri("https://k8s.example.com:6443", &original).unwrap();
        assert_eq!(
            rewritten.to_string(),
            "https://k8s.example.com:6443/api/v1/pods?limit=500"
        );
    }

    #[test]
    fn upstream_uri_fills_in_a_root_path() {
        let original: Uri = "/".parse().unwrap();
        let rewritten = upstream_uri("http://127.0.0.1:6443", &original).unwrap();
        assert_eq!(rewritten.to_string(), "http://127.0.0.1:6443/");
    }

    #[test]
    fn upstream_uri_rejects_unparsable_servers() {
        let original: Uri = "/".parse().unwrap();
        assert!(upstream_uri("http://exa mple", &original).is_err());
    }
}
