//! Prometheus metrics, exposed on a dedicated listener.
//!
//! Recording helpers are plain functions so call sites stay one line; every
//! series carries the `context` label where one is known.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!(address = %addr, "metrics listener started");
}

/// One client-facing request, recorded by the access log middleware.
pub fn record_request(
    context: &str,
    method: &str,
    protocol: &str,
    code: u16,
    duration: Duration,
    cached: bool,
) {
    let labels = [
        ("context", context.to_string()),
        ("method", method.to_string()),
        ("protocol", protocol.to_string()),
        ("code", code.to_string()),
    ];
    counter!("multikube_http_requests_total", &labels).increment(1);
    if cached {
        counter!("multikube_http_requests_cached_total", &labels).increment(1);
    }
    histogram!(
        "multikube_http_duration_seconds",
        "context" => context.to_string(),
        "method" => method.to_string(),
        "protocol" => protocol.to_string()
    )
    .record(duration.as_secs_f64());
}

/// One upstream round-trip, recorded by the transport.
pub fn record_upstream_request(context: &str, method: &str, code: u16, duration: Duration) {
    let labels = [
        ("context", context.to_string()),
        ("method", method.to_string()),
        ("code", code.to_string()),
    ];
    counter!("multikube_backend_requests_total", &labels).increment(1);
    histogram!(
        "multikube_backend_request_duration_seconds",
        "context" => context.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A validator saw a request.
pub fn record_auth_attempt(validator: &str, context: &str) {
    counter!(
        format!("multikube_{validator}_requests_total"),
        "context" => context.to_string()
    )
    .increment(1);
}

/// A validator accepted or rejected a request.
pub fn record_auth_outcome(validator: &str, context: &str, authorized: bool) {
    let outcome = if authorized { "authorized" } else { "unauthorized" };
    counter!(
        format!("multikube_{validator}_requests_{outcome}_total"),
        "context" => context.to_string()
    )
    .increment(1);
}

/// Whether the last JWKS poll against the issuer succeeded.
pub fn record_oidc_provider_up(issuer: &str, up: bool) {
    gauge!(
        "multikube_oidc_provider_up",
        "issuer" => issuer.to_string()
    )
    .set(if up { 1.0 } else { 0.0 });
}

/// Live entry count of one context's response cache.
pub fn record_cache_len(context: &str, len: usize) {
    gauge!(
        "multikube_cache_items_total",
        "context" => context.to_string()
    )
    .set(len as f64);
}

/// Configured TTL of one context's response cache.
pub fn record_cache_ttl(context: &str, ttl: Duration) {
    gauge!(
        "multikube_cache_ttl_seconds",
        "context" => context.to_string()
    )
    .set(ttl.as_secs_f64());
}
