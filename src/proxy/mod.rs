//! The proxy engine: context resolution, per-context transports, and the two
//! request paths (reverse-proxy flow and hijacked tunnel flow).
//!
//! # Request lifecycle
//! ```text
//! Start → ContextResolved → Authenticated → TransportReady ─┬─▶ NormalFlow ─▶ Done
//!                                                           └─▶ TunnelFlow ─▶ Done
//! ```
//! Any transition out of this chain lands in an error response: 502 for
//! routing failures, 401 for authentication, 500 for TLS/upstream/hijack
//! failures (see [`error::ProxyError`]).

pub mod error;
pub mod handler;
pub mod resolver;
pub mod tls;
pub mod transport;
pub mod tunnel;

use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::Cache;
use crate::config::catalog::{Catalog, UpstreamContext};
use crate::config::TransportOptions;
use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::proxy::transport::Transport;

pub use handler::proxy_handler;

/// Per-request state threaded through the middleware pipeline in the request
/// extensions, and mirrored into the response extensions for the access log.
///
/// By the time the proxy handler runs, `context` and `subject` are both
/// non-empty or the request has already been rejected.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Correlation id for log lines.
    pub id: String,

    /// Resolved kubeconfig context name.
    pub context: String,

    /// Authenticated identity to impersonate upstream.
    pub subject: String,
}

/// Shared proxy state: the upstream catalog and the lazily-built map of
/// per-context transports.
pub struct ProxyService {
    catalog: Catalog,
    transports: DashMap<String, Arc<Transport>>,
    options: TransportOptions,
}

impl ProxyService {
    pub fn new(catalog: Catalog, options: TransportOptions) -> Self {
        Self {
            catalog,
            transports: DashMap::new(),
            options,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Get or lazily construct the transport for one upstream.
    ///
    /// Transports are immutable once built and live for the process lifetime.
    /// The entry API re-checks under the shard lock, so two racing requests
    /// end up sharing a single transport.
    pub fn transport_for(&self, upstream: &UpstreamContext) -> Result<Arc<Transport>, ProxyError> {
        if let Some(existing) = self.transports.get(&upstream.name) {
            return Ok(Arc::clone(existing.value()));
        }

        let tls_config = tls::client_config(upstream).map_err(ProxyError::Tls)?;
        let cache = (!self.options.cache_ttl.is_zero())
            .then(|| Cache::new(self.options.cache_ttl));
        if let Some(cache) = &cache {
            metrics::record_cache_ttl(&upstream.name, cache.ttl());
        }

        let transport = Arc::new(Transport::new(
            upstream.name.clone(),
            tls_config,
            cache,
            &self.options,
        ));

        let entry = self
            .transports
            .entry(upstream.name.clone())
            .or_insert(transport);
        Ok(Arc::clone(entry.value()))
    }
}
