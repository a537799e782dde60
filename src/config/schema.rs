//! Typed option structs handed from the CLI to each subsystem.
//!
//! All defaults mirror the flag defaults so tests can start from
//! `Default::default()` and override the few fields they care about.

use std::path::PathBuf;
use std::time::Duration;

/// Listener configuration for the client-facing servers.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host for the plaintext HTTP listener.
    pub host: String,

    /// Port for the plaintext HTTP listener.
    pub port: u16,

    /// Host for the TLS listener.
    pub tls_host: String,

    /// Port for the TLS listener.
    pub tls_port: u16,

    /// Server certificate (PEM). TLS listener is enabled when both this and
    /// `tls_key` are set.
    pub tls_certificate: Option<PathBuf>,

    /// Server private key (PEM).
    pub tls_key: Option<PathBuf>,

    /// Client CA bundle for mutual TLS. Optional.
    pub tls_ca: Option<PathBuf>,

    /// Path for the UNIX domain socket listener, when the `unix` scheme is
    /// enabled.
    pub socket_path: PathBuf,

    /// Listener schemes to enable: any of `http`, `https`, `unix`.
    pub schemes: Vec<String>,

    /// TCP keep-alive applied to accepted connections.
    pub keep_alive: Duration,

    /// Maximum duration for reading the request head.
    pub read_timeout: Duration,

    /// Maximum duration for writing a response. Not applied to tunneled or
    /// streaming responses.
    pub write_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            tls_host: "localhost".to_string(),
            tls_port: 8443,
            tls_certificate: None,
            tls_key: None,
            tls_ca: None,
            socket_path: PathBuf::from("/var/run/multikube.sock"),
            schemes: vec!["https".to_string()],
            keep_alive: Duration::from_secs(3 * 60),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings for the per-context upstream transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// TTL for cached GET responses. Zero disables caching entirely.
    pub cache_ttl: Duration,

    /// TCP connect timeout for upstream dials.
    pub connect_timeout: Duration,

    /// TLS handshake timeout, also used for tunnel handshakes.
    pub tls_handshake_timeout: Duration,

    /// How long pooled upstream connections may sit idle.
    pub idle_timeout: Duration,

    /// TCP keep-alive interval on upstream connections.
    pub keep_alive: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Settings for the OIDC/JWKS validator.
#[derive(Debug, Clone)]
pub struct OidcOptions {
    /// Issuer URL; discovery is performed against
    /// `<issuer>/.well-known/openid-configuration`.
    pub issuer_url: String,

    /// JWT claim carrying the username to impersonate.
    pub username_claim: String,

    /// Interval between JWKS polls.
    pub poll_interval: Duration,

    /// CA bundle used to verify the issuer, when it is not publicly trusted.
    pub ca_file: Option<PathBuf>,

    /// Skip TLS verification towards the issuer.
    pub insecure_skip_verify: bool,
}

impl Default for OidcOptions {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            username_claim: "sub".to_string(),
            poll_interval: Duration::from_secs(2),
            ca_file: None,
            insecure_skip_verify: false,
        }
    }
}
