//! Context resolution: which upstream does this request target?
//!
//! Priority is fixed: the `Multikube-Context` header wins and leaves the URL
//! untouched; otherwise the first path segment names the context and is
//! stripped from the forwarded path (`/dev/api/v1/pods` → context `dev`,
//! upstream path `/api/v1/pods`). The literal segment `api` never names a
//! context since it starts every real Kubernetes path.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::uri::{PathAndQuery, Uri};
use http::HeaderName;

use crate::proxy::RequestContext;

/// Request header selecting the upstream context.
pub static CONTEXT_HEADER: HeaderName = HeaderName::from_static("multikube-context");

/// Resolve the context name without modifying the request. Used by code that
/// only needs the name as a label (logger, metrics).
pub fn peek_context_name(req: &Request) -> Option<String> {
    if let Some(value) = header_context(req) {
        return Some(value);
    }
    url_context(req.uri().path()).map(|(name, _)| name)
}

/// Middleware: record the resolved context in the [`RequestContext`] and, when
/// the name came from the URL, strip it from the forwarded path.
///
/// Resolution failure is not terminal here; the proxy handler rejects
/// requests whose context is still empty with a 502.
pub async fn resolve(mut req: Request, next: Next) -> Response {
    let mut resolved = String::new();

    if let Some(name) = header_context(&req) {
        resolved = name;
    } else if let Some((name, remainder)) = url_context(req.uri().path()) {
        resolved = name;
        strip_prefix(&mut req, &remainder);
    }

    if let Some(rc) = req.extensions_mut().get_mut::<RequestContext>() {
        rc.context = resolved.clone();
    }

    let snapshot = req.extensions().get::<RequestContext>().cloned();
    let mut res = next.run(req).await;

    // Make the context visible to the access logger even when an inner
    // middleware short-circuited and never mirrored it.
    if res.extensions().get::<RequestContext>().is_none() {
        if let Some(rc) = snapshot {
            res.extensions_mut().insert(rc);
        }
    }
    res
}

fn header_context(req: &Request) -> Option<String> {
    req.headers()
        .get(&CONTEXT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Split `/name/rest...` into the context name and the remaining path.
fn url_context(path: &str) -> Option<(String, String)> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;
    if first.eq_ignore_ascii_case("api") {
        return None;
    }
    let remainder = segments.collect::<Vec<_>>().join("/");
    Some((first.to_string(), format!("/{remainder}")))
}

fn strip_prefix(req: &mut Request, remainder: &str) {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{remainder}?{query}"),
        None => remainder.to_string(),
    };
    let Ok(path_and_query) = path_and_query.parse::<PathAndQuery>() else {
        return;
    };

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}
