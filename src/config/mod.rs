//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! kubeconfig file (YAML)
//!     → kubeconfig.rs (parse & deserialize)
//!     → catalog.rs (resolve contexts → clusters + users)
//!     → Catalog (validated, immutable)
//!     → shared via Arc to the proxy handler
//! ```
//!
//! # Design Decisions
//! - The catalog is immutable once loaded; changing upstreams requires a restart
//! - Only the kubeconfig fields the proxy needs are modeled; everything else is ignored
//! - Inline `*-data` fields are base64-decoded at load time so request-time code never fails on them

pub mod catalog;
pub mod kubeconfig;
pub mod schema;

use std::path::PathBuf;

use thiserror::Error;

pub use catalog::{Catalog, PemSource, UpstreamContext};
pub use kubeconfig::Kubeconfig;
pub use schema::{OidcOptions, ServerOptions, TransportOptions};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid base64 in field {field} of {name}: {source}")]
    InvalidData {
        field: &'static str,
        name: String,
        source: base64::DecodeError,
    },

    #[error("kubeconfig defines no usable contexts")]
    EmptyCatalog,
}
