//! Per-context upstream transport: a pooled HTTP/1.1+HTTP/2 client bound to
//! one TLS configuration, with a read-through cache for safe GETs.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::cache::{is_cacheable_url, Cache, CachedResponse};
use crate::config::TransportOptions;
use crate::observability::metrics;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// Chunk bound for relayed response bodies. Upstream frames are split to at
/// most this size before they reach the client.
const NORMAL_FLOW_BUFFER: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream request failed: {0}")]
    RoundTrip(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read upstream response body: {0}")]
    Body(axum::Error),

    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),
}

/// One transport per context, reused across requests so TLS handshakes are
/// amortized and HTTP/2 streams stay multiplexed.
pub struct Transport {
    context: String,
    client: HttpsClient,
    cache: Option<Cache>,
    tls_config: Arc<rustls::ClientConfig>,
}

impl Transport {
    pub fn new(
        context: String,
        tls_config: rustls::ClientConfig,
        cache: Option<Cache>,
        options: &TransportOptions,
    ) -> Self {
        let tls_config = Arc::new(tls_config);

        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_connect_timeout(Some(options.connect_timeout));
        connector.set_keepalive(Some(options.keep_alive));
        connector.set_nodelay(true);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config((*tls_config).clone())
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(options.idle_timeout)
            .pool_max_idle_per_host(100)
            .build(https);

        Self {
            context,
            client,
            cache,
            tls_config,
        }
    }

    /// The TLS configuration this transport was built with. Tunnels clone it
    /// for their own handshakes.
    pub fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.tls_config)
    }

    /// Execute one round-trip, consulting and populating the cache.
    ///
    /// Cache hits never touch the network. Cacheable responses (GET, status
    /// 200/304, not a watch/follow stream) are buffered so the stored bytes
    /// and the response handed back are independent; everything else streams
    /// straight through.
    pub async fn round_trip(
        &self,
        req: Request<Body>,
    ) -> Result<Response<Body>, TransportError> {
        let method = req.method().clone();
        let key = req.uri().to_string();
        let streamable = !is_cacheable_url(req.uri());

        if method == Method::GET {
            if let Some((hit, age)) = self.cache.as_ref().and_then(|c| c.get(&key)) {
                tracing::debug!(context = %self.context, key = %key, age = ?age, "cache hit");
                return Ok(bounded(hit.to_response(age)));
            }
        }

        let started = Instant::now();
        let response = self.client.request(req).await?;
        metrics::record_upstream_request(
            &self.context,
            method.as_str(),
            response.status().as_u16(),
            started.elapsed(),
        );

        let (parts, incoming) = response.into_parts();
        let cacheable = method == Method::GET
            && !streamable
            && matches!(parts.status, StatusCode::OK | StatusCode::NOT_MODIFIED);

        let response = match (&self.cache, cacheable) {
            (Some(cache), true) => {
                let body = incoming
                    .collect()
                    .await
                    .map_err(|e| TransportError::Body(axum::Error::new(e)))?
                    .to_bytes();
                cache.set(
                    &key,
                    CachedResponse::new(parts.status, &parts.headers, body.clone()),
                );
                metrics::record_cache_len(&self.context, cache.len());
                Response::from_parts(parts, Body::from(body))
            }
            _ => Response::from_parts(parts, Body::new(incoming)),
        };
        Ok(bounded(response))
    }
}

/// Cap every data frame of the response body at [`NORMAL_FLOW_BUFFER`] bytes,
/// so the client observes upstream data in fixed-size chunks regardless of
/// how large the frames coming off the connection are.
fn bounded(response: Response<Body>) -> Response<Body> {
    response.map(|body| Body::new(BoundedBody::new(body, NORMAL_FLOW_BUFFER)))
}

/// Body adapter that re-chunks data frames to a fixed upper size.
///
/// Oversized frames are split; the remainder is handed out on subsequent
/// polls before the inner body is polled again. Trailer frames pass through
/// untouched.
struct BoundedBody<B> {
    inner: B,
    pending: Bytes,
    limit: usize,
}

impl<B> BoundedBody<B> {
    fn new(inner: B, limit: usize) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            limit,
        }
    }
}

impl<B> http_body::Body for BoundedBody<B>
where
    B: http_body::Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if !this.pending.is_empty() {
            let take = this.limit.min(this.pending.len());
            return Poll::Ready(Some(Ok(Frame::data(this.pending.split_to(take)))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(mut data) => {
                    if data.len() > this.limit {
                        let chunk = data.split_to(this.limit);
                        this.pending = data;
                        Poll::Ready(Some(Ok(Frame::data(chunk))))
                    } else {
                        Poll::Ready(Some(Ok(Frame::data(data))))
                    }
                }
                Err(other) => Poll::Ready(Some(Ok(other))),
            },
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_empty() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body::Body;
    use http_body_util::Full;

    #[tokio::test]
    async fn bounded_body_splits_oversized_frames() {
        let payload = Bytes::from(vec![0xA7u8; 10_000]);
        let mut body = BoundedBody::new(Full::new(payload.clone()), NORMAL_FLOW_BUFFER);

        let mut chunks = Vec::new();
        let mut reassembled = Vec::new();
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            assert!(data.len() <= NORMAL_FLOW_BUFFER);
            reassembled.extend_from_slice(&data);
            chunks.push(data.len());
        }

        assert_eq!(reassembled, payload);
        assert_eq!(chunks, vec![4096, 4096, 1808]);
    }

    #[tokio::test]
    async fn bounded_body_passes_small_frames_through() {
        let payload = Bytes::from_static(b"{\"items\":[]}");
        let mut body = BoundedBody::new(Full::new(payload.clone()), NORMAL_FLOW_BUFFER);

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, payload);
        assert!(body.frame().await.is_none());
        assert!(body.is_end_stream());
    }
}
