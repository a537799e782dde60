//! Access-log middleware: one structured line and one metrics sample per
//! request, cache hits flagged via the `Multikube-Cache-Age` response header.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::header;
use uuid::Uuid;

use crate::cache::CACHE_AGE_HEADER;
use crate::observability::metrics;
use crate::proxy::RequestContext;

/// Outermost middleware. Seeds the [`RequestContext`] (downstream stages fill
/// in context and subject), then records status, size, duration and
/// cache-hit after the rest of the chain has run.
pub async fn access_log(mut req: Request, next: Next) -> Response {
    let started = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    req.extensions_mut().insert(RequestContext {
        id: request_id.clone(),
        ..Default::default()
    });

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let protocol = format!("{:?}", req.version());

    let res = next.run(req).await;

    let status = res.status().as_u16();
    let context = res
        .extensions()
        .get::<RequestContext>()
        .map(|rc| rc.context.clone())
        .unwrap_or_default();
    let cached = res.headers().contains_key(&CACHE_AGE_HEADER);
    let bytes = res
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let duration = started.elapsed();

    metrics::record_request(&context, method.as_str(), &protocol, status, duration, cached);

    tracing::info!(
        request_id = %request_id,
        context = %context,
        method = %method,
        path = %path,
        query = %query,
        protocol = %protocol,
        status,
        bytes,
        cached,
        duration = ?duration,
        "request"
    );

    res
}
