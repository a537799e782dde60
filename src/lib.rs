//! Multikube, a reverse proxy for multiple Kubernetes API servers.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                    MULTIKUBE                     │
//!                        │                                                  │
//!   Client Request       │  ┌─────────┐   ┌────────────┐   ┌────────────┐  │
//!   ────────────────────▶│  │ server  │──▶│ middleware │──▶│   proxy    │  │
//!                        │  │listener │   │ log → ctx  │   │  handler   │  │
//!                        │  └─────────┘   │ → jwt →    │   └─────┬──────┘  │
//!                        │                │ rs256/oidc │         │         │
//!                        │                └────────────┘         ▼         │
//!                        │                               ┌────────────┐    │
//!   Client Response      │                               │ transport  │────┼──▶ kube-apiserver
//!   ◀────────────────────┼───────────────────────────────│  + cache   │    │    (per context)
//!                        │                               └────────────┘    │
//!                        │                                                 │
//!                        │  ┌──────────────────────────────────────────┐   │
//!                        │  │           Cross-Cutting Concerns         │   │
//!                        │  │  config (kubeconfig catalog) · cache ·   │   │
//!                        │  │  auth (RS256 / OIDC JWKS) · metrics      │   │
//!                        │  └──────────────────────────────────────────┘   │
//!                        └─────────────────────────────────────────────────┘
//! ```
//!
//! A request is routed to one of several configured upstream API servers (a
//! kubeconfig "context"), the client is authenticated from its bearer token,
//! and the request is re-issued upstream with `Impersonate-User` set to the
//! authenticated subject. Requests carrying an `Upgrade` header (exec, attach,
//! port-forward) are tunneled at the byte level instead of proxied.

pub mod auth;
pub mod cache;
pub mod config;
pub mod middleware;
pub mod observability;
pub mod proxy;
pub mod server;

pub use config::catalog::{Catalog, UpstreamContext};
pub use config::kubeconfig::Kubeconfig;
pub use proxy::ProxyService;
pub use server::Server;
