//! Byte-level tunneling for Upgrade requests (exec, attach, port-forward).
//!
//! The client's request is written verbatim (with rewritten credentials) onto
//! a dedicated TLS connection to the upstream, the upstream's response head is
//! relayed back, and on a `101 Switching Protocols` the client connection is
//! taken over and both sockets are pumped until either side closes. Closing
//! one end is the teardown signal for the other; there is no separate
//! cancellation channel.
//!
//! When an HTTPS proxy is configured in the environment, the upstream leg is
//! layered over an HTTP/1.1 `CONNECT` tunnel instead of a direct dial, with
//! certificate verification disabled for that handshake only.
//!
//! Tunnels bypass the response cache entirely.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{header, StatusCode, Uri};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::catalog::UpstreamContext;
use crate::proxy::error::ProxyError;
use crate::proxy::handler::IMPERSONATE_USER;
use crate::proxy::transport::Transport;
use crate::proxy::{tls, ProxyService, RequestContext};

/// Copy buffer size for the two tunnel directions.
const TUNNEL_BUFFER: usize = 64 * 1024;

/// Upper bound on a response head read off the raw stream.
const MAX_HEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("invalid server name '{0}'")]
    ServerName(String),

    #[error("failed to reach upstream: {0}")]
    Connect(std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("failed to reach HTTPS proxy {proxy}: {source}")]
    ProxyConnect {
        proxy: String,
        source: std::io::Error,
    },

    #[error("HTTPS proxy refused CONNECT with status {0}")]
    ProxyRefused(u16),

    #[error("malformed response head from upstream")]
    MalformedHead,

    #[error("connection closed during tunnel setup")]
    UnexpectedEof,

    #[error("tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed HTTP/1.1 response head plus whatever bytes were read past it.
struct ResponseHead {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    leftover: Bytes,
}

/// Establish the tunnel and hand the client response back.
pub async fn tunnel(
    service: &ProxyService,
    upstream: &UpstreamContext,
    transport: &Transport,
    rc: &RequestContext,
    mut req: Request,
) -> Result<Response, ProxyError> {
    // Taking the upgrade future is the hyper equivalent of hijacking the
    // client socket; without it there is nothing to stream into.
    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(ProxyError::HijackUnsupported)?;

    let (host, port) = host_port(&upstream.server).map_err(ProxyError::Tunnel)?;

    // Per-tunnel TLS config: the shared transport config is cloned, never
    // mutated. ALPN is pinned to http/1.1 since the tunnel is a raw byte
    // pipe and h2 framing would not survive it.
    let mut tls_config = (*transport.tls_config()).clone();
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let handshake_timeout = service.options().tls_handshake_timeout;
    let mut stream = match https_proxy_from_env() {
        Some(proxy) => {
            tls::disable_verification(&mut tls_config);
            proxied_connect(&proxy, &host, port, tls_config, handshake_timeout)
                .await
                .map_err(ProxyError::Tunnel)?
        }
        None => direct_connect(&host, port, tls_config, handshake_timeout)
            .await
            .map_err(ProxyError::Tunnel)?,
    };

    let head = serialize_request(
        &req,
        &format!("{host}:{port}"),
        &rc.subject,
        upstream.token.as_deref().unwrap_or(""),
    );
    stream
        .write_all(&head)
        .await
        .map_err(|e| ProxyError::Tunnel(TunnelError::Io(e)))?;

    let response_head = read_head(&mut stream).await.map_err(ProxyError::Tunnel)?;
    let status = response_head.status;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    for (name, value) in &response_head.headers {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response.extensions_mut().insert(rc.clone());

    if status == StatusCode::SWITCHING_PROTOCOLS {
        let context = rc.context.clone();
        let leftover = response_head.leftover;
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::debug!(context = %context, error = %e, "client upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);
            if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                return;
            }
            // Both sockets drop when this task returns, so an error (or EOF)
            // in either direction tears the whole tunnel down.
            match tokio::io::copy_bidirectional_with_sizes(
                &mut client,
                &mut stream,
                TUNNEL_BUFFER,
                TUNNEL_BUFFER,
            )
            .await
            {
                Ok((to_upstream, to_client)) => tracing::debug!(
                    context = %context,
                    bytes_to_upstream = to_upstream,
                    bytes_to_client = to_client,
                    "tunnel closed"
                ),
                Err(e) => tracing::debug!(context = %context, error = %e, "tunnel closed"),
            }
        });
    } else {
        // Upstream declined to upgrade; relay its (finite) response body.
        let body = read_declined_body(&mut stream, &response_head)
            .await
            .map_err(ProxyError::Tunnel)?;
        *response.body_mut() = Body::from(body);
    }

    Ok(response)
}

/// Dial the upstream directly and complete the TLS handshake.
async fn direct_connect(
    host: &str,
    port: u16,
    config: rustls::ClientConfig,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, TunnelError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(TunnelError::Connect)?;
    handshake(tcp, host, config, timeout).await
}

/// Dial the HTTPS proxy, establish a CONNECT tunnel, then handshake TLS
/// through it.
async fn proxied_connect(
    proxy: &str,
    host: &str,
    port: u16,
    config: rustls::ClientConfig,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, TunnelError> {
    let proxy_addr = host_and_port(proxy);
    let mut tcp = TcpStream::connect(&proxy_addr)
        .await
        .map_err(|source| TunnelError::ProxyConnect {
            proxy: proxy_addr.clone(),
            source,
        })?;

    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    tcp.write_all(connect.as_bytes()).await?;

    let head = read_head(&mut tcp).await?;
    if head.status != StatusCode::OK {
        return Err(TunnelError::ProxyRefused(head.status.as_u16()));
    }

    handshake(tcp, host, config, timeout).await
}

async fn handshake(
    tcp: TcpStream,
    host: &str,
    config: rustls::ClientConfig,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, TunnelError> {
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| TunnelError::ServerName(host.to_string()))?;
    match tokio::time::timeout(timeout, connector.connect(name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TunnelError::Handshake(e)),
        Err(_) => Err(TunnelError::HandshakeTimeout),
    }
}

/// Serialize the client request as an HTTP/1.1 head with rewritten
/// credentials. The upstream token is always written, replacing whatever the
/// client sent. Upgrade requests carry no body, so the head is the whole
/// request.
fn serialize_request(req: &Request, host_header: &str, subject: &str, token: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    out.extend_from_slice(format!("Host: {host_header}\r\n").as_bytes());
    for (name, value) in req.headers() {
        if name == header::HOST || name == header::AUTHORIZATION || name == IMPERSONATE_USER {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Authorization: Bearer {token}\r\n").as_bytes());
    out.extend_from_slice(format!("Impersonate-User: {subject}\r\n").as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

/// Read an HTTP/1.1 response head off a raw stream, returning any bytes read
/// past the blank line untouched.
async fn read_head<S>(stream: &mut S) -> Result<ResponseHead, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        if let Some(end) = find_blank_line(&buf) {
            let leftover = Bytes::copy_from_slice(&buf[end + 4..]);
            let (status, headers) = parse_head(&buf[..end])?;
            return Ok(ResponseHead {
                status,
                headers,
                leftover,
            });
        }
        if buf.len() > MAX_HEAD {
            return Err(TunnelError::MalformedHead);
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(TunnelError::UnexpectedEof);
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(
    head: &[u8],
) -> Result<(StatusCode, Vec<(HeaderName, HeaderValue)>), TunnelError> {
    let mut lines = head.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let status_line = lines.next().ok_or(TunnelError::MalformedHead)?;
    let status_line = std::str::from_utf8(status_line).map_err(|_| TunnelError::MalformedHead)?;
    let code = status_line
        .split_whitespace()
        .nth(1)
        .ok_or(TunnelError::MalformedHead)?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or(TunnelError::MalformedHead)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(TunnelError::MalformedHead)?;
        let name =
            HeaderName::from_bytes(&line[..colon]).map_err(|_| TunnelError::MalformedHead)?;
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| TunnelError::MalformedHead)?;
        headers.push((name, value));
    }
    Ok((status, headers))
}

/// Read the body of a non-101 response, bounded by its `Content-Length`.
async fn read_declined_body<S>(
    stream: &mut S,
    head: &ResponseHead,
) -> Result<Bytes, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let length = head
        .headers
        .iter()
        .find(|(name, _)| name == header::CONTENT_LENGTH)
        .and_then(|(_, v)| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = BytesMut::from(&head.leftover[..]);
    while body.len() < length {
        let n = stream.read_buf(&mut body).await?;
        if n == 0 {
            break;
        }
    }
    body.truncate(length);
    Ok(body.freeze())
}

/// Derive the host and TLS port from an upstream server URL.
fn host_port(server: &str) -> Result<(String, u16), TunnelError> {
    let uri: Uri = server
        .parse()
        .map_err(|e| TunnelError::InvalidUrl(format!("{server}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| TunnelError::InvalidUrl(format!("{server}: no host")))?
        .to_string();
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("http") => 80,
        _ => 443,
    });
    Ok((host, port))
}

/// Proxy address from the environment, scheme stripped, port 80 by default.
fn host_and_port(uri: &str) -> String {
    let stripped = uri
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    if stripped.contains(':') {
        stripped.to_string()
    } else {
        format!("{stripped}:80")
    }
}

/// The HTTPS proxy configured in the process environment, if any. HTTP_PROXY
/// is deliberately ignored: upstream connections are always TLS.
fn https_proxy_from_env() -> Option<String> {
    std::env::var("HTTPS_PROXY")
        .or_else(|_| std::env::var("https_proxy"))
        .ok()
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[tokio::test]
    async fn read_head_parses_status_headers_and_leftover() {
        let raw: &[u8] =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: SPDY/3.1\r\nConnection: Upgrade\r\n\r\nextra";
        let mut cursor = raw;
        let head = read_head(&mut cursor).await.unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers[0].0.as_str(), "upgrade");
        assert_eq!(head.leftover, Bytes::from_static(b"extra"));
    }

    #[tokio::test]
    async fn read_head_rejects_truncated_streams() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Le";
        let mut cursor = raw;
        assert!(matches!(
            read_head(&mut cursor).await,
            Err(TunnelError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn read_declined_body_honors_content_length() {
        let raw: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 4\r\n\r\noops";
        let mut cursor = raw;
        let head = read_head(&mut cursor).await.unwrap();
        let body = read_declined_body(&mut cursor, &head).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"oops"));
    }

    #[test]
    fn serialize_request_rewrites_credentials() {
        let req = http::Request::builder()
            .method("POST")
            .uri("/api/v1/namespaces/default/pods/web/exec?command=sh")
            .header("Upgrade", "SPDY/3.1")
            .header("Connection", "Upgrade")
            .header("Authorization", "Bearer client-token")
            .header("Impersonate-User", "spoofed")
            .body(Body::empty())
            .unwrap();

        let head = serialize_request(&req, "k8s.example.com:6443", "alice", "upstream-token");
        let text = String::from_utf8(head).unwrap();

        assert!(text.starts_with(
            "POST /api/v1/namespaces/default/pods/web/exec?command=sh HTTP/1.1\r\n"
        ));
        assert!(text.contains("Host: k8s.example.com:6443\r\n"));
        assert!(text.contains("Authorization: Bearer upstream-token\r\n"));
        assert!(text.contains("Impersonate-User: alice\r\n"));
        assert!(!text.contains("client-token"));
        assert!(!text.contains("spoofed"));
        assert!(text.contains("upgrade: SPDY/3.1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn host_port_defaults_by_scheme() {
        assert_eq!(
            host_port("https://k8s.example.com").unwrap(),
            ("k8s.example.com".to_string(), 443)
        );
        assert_eq!(
            host_port("http://127.0.0.1:8001").unwrap(),
            ("127.0.0.1".to_string(), 8001)
        );
    }

    #[test]
    fn proxy_address_strips_scheme_and_defaults_port() {
        assert_eq!(host_and_port("http://proxy.corp"), "proxy.corp:80");
        assert_eq!(host_and_port("proxy.corp:3128"), "proxy.corp:3128");
    }
}
