//! Client-facing listeners and router assembly.
//!
//! # Responsibilities
//! - Compose the middleware pipeline around the proxy handler
//! - Serve plaintext HTTP, TLS (with optional client-cert auth), and UNIX
//!   domain socket listeners according to the enabled schemes
//! - Graceful shutdown on ctrl-c / SIGTERM
//!
//! Upgrade support matters here: both the plain `axum::serve` path and the
//! TLS accept loop run connections with upgrades enabled so the tunnel flow
//! can take over client sockets.

pub mod tls;

use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::any;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;

use crate::auth::{oidc, rs256, OidcValidator, Rs256Validator};
use crate::config::ServerOptions;
use crate::middleware::logging;
use crate::proxy::{handler, resolver, ProxyService};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS listener requires --tls-certificate and --tls-key")]
    MissingTlsMaterial,

    #[error(transparent)]
    Tls(#[from] tls::ServerTlsError),

    #[error("no listeners enabled")]
    NoListeners,

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Build the axum router with the full middleware pipeline.
///
/// Layers execute outermost-first in the order: access log, context
/// resolver, JWT parse, RS256 and/or OIDC validation, proxy handler. (axum
/// applies the *last* added layer first, hence the reversed registration
/// below.)
pub fn build_router(
    service: Arc<ProxyService>,
    rs256: Option<Arc<Rs256Validator>>,
    oidc: Option<Arc<OidcValidator>>,
) -> Router {
    let mut router = Router::new()
        .route("/", any(handler::proxy_handler))
        .route("/{*path}", any(handler::proxy_handler))
        .with_state(service);

    if let Some(validator) = oidc {
        router = router.layer(from_fn_with_state(validator, oidc::validate));
    }
    if let Some(validator) = rs256 {
        router = router.layer(from_fn_with_state(validator, rs256::validate));
    }

    router
        .layer(from_fn(crate::auth::jwt::require_bearer))
        .layer(from_fn(resolver::resolve))
        .layer(from_fn(logging::access_log))
}

/// The set of client-facing listeners.
pub struct Server {
    router: Router,
    options: ServerOptions,
}

impl Server {
    pub fn new(router: Router, options: ServerOptions) -> Self {
        Self { router, options }
    }

    /// Bind every enabled listener, then serve until a shutdown signal.
    ///
    /// Bind and TLS-material failures surface before any traffic is served,
    /// so startup problems become a non-zero exit rather than a half-running
    /// proxy.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut tasks = Vec::new();

        for scheme in &self.options.schemes {
            match scheme.as_str() {
                "http" => {
                    let addr = format!("{}:{}", self.options.host, self.options.port);
                    let listener = TcpListener::bind(&addr).await.map_err(|source| {
                        ServerError::Bind {
                            addr: addr.clone(),
                            source,
                        }
                    })?;
                    tracing::info!(address = %addr, "HTTP listener bound");
                    tasks.push(tokio::spawn(serve_plain(listener, self.router.clone())));
                }
                "https" => {
                    let (cert, key) = match (
                        &self.options.tls_certificate,
                        &self.options.tls_key,
                    ) {
                        (Some(cert), Some(key)) => (cert.clone(), key.clone()),
                        _ => return Err(ServerError::MissingTlsMaterial),
                    };
                    let config =
                        tls::server_config(&cert, &key, self.options.tls_ca.as_deref())?;
                    let addr = format!("{}:{}", self.options.tls_host, self.options.tls_port);
                    let listener = TcpListener::bind(&addr).await.map_err(|source| {
                        ServerError::Bind {
                            addr: addr.clone(),
                            source,
                        }
                    })?;
                    tracing::info!(address = %addr, "HTTPS listener bound");
                    tasks.push(tokio::spawn(serve_tls(
                        listener,
                        TlsAcceptor::from(Arc::new(config)),
                        self.router.clone(),
                        self.options.clone(),
                    )));
                }
                "unix" => {
                    let path = self.options.socket_path.clone();
                    // A stale socket from a previous run blocks the bind.
                    let _ = std::fs::remove_file(&path);
                    let listener =
                        UnixListener::bind(&path).map_err(|source| ServerError::Bind {
                            addr: path.display().to_string(),
                            source,
                        })?;
                    tracing::info!(path = %path.display(), "UNIX socket listener bound");
                    tasks.push(tokio::spawn(serve_unix(listener, self.router.clone())));
                }
                other => {
                    tracing::warn!(scheme = %other, "unknown listener scheme, ignoring");
                }
            }
        }

        if tasks.is_empty() {
            return Err(ServerError::NoListeners);
        }

        for task in tasks {
            match task.await {
                Ok(result) => result?,
                Err(e) => tracing::error!(error = %e, "listener task panicked"),
            }
        }

        tracing::info!("all listeners stopped");
        Ok(())
    }
}

async fn serve_plain(listener: TcpListener, router: Router) -> Result<(), ServerError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn serve_unix(listener: UnixListener, router: Router) -> Result<(), ServerError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// TLS accept loop: handshake with a timeout, then drive the connection with
/// upgrade support so tunnels work across the TLS boundary.
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    options: ServerOptions,
) -> Result<(), ServerError> {
    let handshake_timeout = std::time::Duration::from_secs(10);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown_signal() => break,
        };

        let keepalive = TcpKeepalive::new().with_time(options.keep_alive);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(peer = %peer, error = %e, "failed to set TCP keepalive");
        }

        let acceptor = acceptor.clone();
        let router = router.clone();
        let read_timeout = options.read_timeout;
        tokio::spawn(async move {
            let tls_stream =
                match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => {
                        tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        tracing::debug!(peer = %peer, "TLS handshake timed out");
                        return;
                    }
                };

            // hyper hands us Request<Incoming>; the router wants axum's Body.
            let service = hyper::service::service_fn(move |req: http::Request<Incoming>| {
                use tower::ServiceExt;
                router.clone().oneshot(req.map(axum::body::Body::new))
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(read_timeout);
            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await
            {
                tracing::debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }
    Ok(())
}

/// Resolves when the process receives ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
