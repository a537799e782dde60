//! multikube: Kubernetes multi-cluster manager.
//!
//! Manages multiple Kubernetes clusters and provides a single API endpoint to
//! clients. See the library crate for the architecture overview.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multikube::auth::{OidcValidator, Rs256Validator};
use multikube::config::{Catalog, Kubeconfig, OidcOptions, ServerOptions, TransportOptions};
use multikube::observability::metrics;
use multikube::server::build_router;
use multikube::{ProxyService, Server};

/// Build information reported by --version, stamped in by build.rs.
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("GIT_COMMIT"),
    "\nbranch: ",
    env!("GIT_BRANCH"),
    "\nprofile: ",
    env!("BUILD_PROFILE"),
);

#[derive(Parser, Debug)]
#[command(
    name = "multikube",
    version,
    long_version = LONG_VERSION,
    about = "Kubernetes multi-cluster manager",
    long_about = "Manages multiple Kubernetes clusters and provides a single API to clients"
)]
struct Flags {
    /// The host address on which to listen for the --port port
    #[arg(long, default_value = "localhost")]
    host: String,

    /// The port to listen on for insecure connections
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// The host address on which to listen for the --tls-port port
    #[arg(long, default_value = "localhost")]
    tls_host: String,

    /// The port to listen on for secure connections
    #[arg(long, default_value_t = 8443)]
    tls_port: u16,

    /// The certificate to use for secure connections
    #[arg(long)]
    tls_certificate: Option<PathBuf>,

    /// The private key to use for secure connections
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// The certificate authority file to be used with mutual TLS auth
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// The unix socket to listen on
    #[arg(long, default_value = "/var/run/multikube.sock")]
    socket_path: PathBuf,

    /// The listeners to enable; repeatable. Any of http, https, unix
    #[arg(long = "scheme", default_value = "https")]
    schemes: Vec<String>,

    /// Absolute path to a kubeconfig file
    #[arg(long, default_value = "/etc/multikube/kubeconfig")]
    kubeconfig: PathBuf,

    /// The RS256 public key used to validate the signature of client JWTs
    #[arg(long, conflicts_with = "oidc_issuer_url")]
    rs256_public_key: Option<PathBuf>,

    /// The URL of the OpenID issuer. If set, it is used to verify client JWTs
    /// against the issuer's published JWKS
    #[arg(long)]
    oidc_issuer_url: Option<String>,

    /// The OpenID claim to use as the user name. Claims other than the
    /// default are not guaranteed to be unique and immutable
    #[arg(long, default_value = "sub")]
    oidc_username_claim: String,

    /// The certificate authority file used when verifying the OpenID server
    #[arg(long)]
    oidc_ca_file: Option<PathBuf>,

    /// Interval at which the OpenID issuer is polled for keys
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    oidc_poll_interval: Duration,

    /// Skip TLS verification towards the OpenID issuer
    #[arg(long)]
    oidc_insecure_skip_verify: bool,

    /// Maximum duration before cached responses are invalidated. Set to 0s to
    /// disable the cache
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    cache_ttl: Duration,

    /// TCP keep-alive on accepted connections; prunes dead connections
    #[arg(long, default_value = "3m", value_parser = humantime::parse_duration)]
    keep_alive: Duration,

    /// Maximum duration before timing out read of the request
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    read_timeout: Duration,

    /// Maximum duration before timing out write of the response
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    write_timeout: Duration,

    /// The host address on which to listen for the --metrics-port port
    #[arg(long, default_value = "localhost")]
    metrics_host: String,

    /// The port to expose Prometheus metrics on
    #[arg(long, default_value_t = 8888)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multikube=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "multikube starting");

    let kubeconfig = Kubeconfig::load(&flags.kubeconfig)
        .with_context(|| format!("loading kubeconfig {}", flags.kubeconfig.display()))?;
    let catalog = Catalog::from_kubeconfig(&kubeconfig).context("building upstream catalog")?;
    tracing::info!(
        contexts = ?catalog.names().collect::<Vec<_>>(),
        kubeconfig = %flags.kubeconfig.display(),
        "upstream catalog loaded"
    );

    let rs256 = flags
        .rs256_public_key
        .as_deref()
        .map(Rs256Validator::from_pem_file)
        .transpose()
        .context("loading RS256 public key")?
        .map(Arc::new);

    let oidc = match &flags.oidc_issuer_url {
        Some(issuer) => {
            let validator = Arc::new(
                OidcValidator::new(&OidcOptions {
                    issuer_url: issuer.clone(),
                    username_claim: flags.oidc_username_claim.clone(),
                    poll_interval: flags.oidc_poll_interval,
                    ca_file: flags.oidc_ca_file.clone(),
                    insecure_skip_verify: flags.oidc_insecure_skip_verify,
                })
                .context("configuring OIDC validator")?,
            );
            validator.spawn_poller();
            tracing::info!(issuer = %issuer, interval = ?flags.oidc_poll_interval, "OIDC JWKS poller started");
            Some(validator)
        }
        None => None,
    };

    if rs256.is_none() && oidc.is_none() {
        tracing::warn!("no token validator configured; every request will be rejected");
    }

    let metrics_addr = format!("{}:{}", flags.metrics_host, flags.metrics_port)
        .to_socket_addrs()
        .context("resolving metrics address")?
        .next()
        .context("metrics address resolved to nothing")?;
    metrics::init_metrics(metrics_addr);

    let service = Arc::new(ProxyService::new(
        catalog,
        TransportOptions {
            cache_ttl: flags.cache_ttl,
            ..Default::default()
        },
    ));

    let router = build_router(service, rs256, oidc);
    let server = Server::new(
        router,
        ServerOptions {
            host: flags.host,
            port: flags.port,
            tls_host: flags.tls_host,
            tls_port: flags.tls_port,
            tls_certificate: flags.tls_certificate,
            tls_key: flags.tls_key,
            tls_ca: flags.tls_ca,
            socket_path: flags.socket_path,
            schemes: flags.schemes,
            keep_alive: flags.keep_alive,
            read_timeout: flags.read_timeout,
            write_timeout: flags.write_timeout,
        },
    );

    server.run().await?;

    tracing::info!("shutdown complete");
    Ok(())
}
