//! Deserialization of the standard kubeconfig file format.
//!
//! Only the fields the proxy consumes are modeled: cluster `server`,
//! certificate authority (file or inline), `insecure-skip-tls-verify`, and
//! authinfo `token` / client certificate material. Unknown fields are ignored
//! so kubeconfigs produced by other tooling load unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigError;

/// Top-level kubeconfig structure (`clusters`, `contexts`, `users`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Kubeconfig {
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,

    #[serde(default)]
    pub contexts: Vec<NamedContext>,

    #[serde(default)]
    pub users: Vec<NamedAuthInfo>,

    #[serde(default, rename = "current-context")]
    pub current_context: Option<String>,
}

/// A cluster entry together with its name.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

/// Connection details for one API server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Cluster {
    pub server: String,

    #[serde(default, rename = "certificate-authority")]
    pub certificate_authority: Option<PathBuf>,

    #[serde(default, rename = "certificate-authority-data")]
    pub certificate_authority_data: Option<String>,

    #[serde(default, rename = "insecure-skip-tls-verify")]
    pub insecure_skip_tls_verify: bool,
}

/// A context entry together with its name.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

/// A context ties a cluster to the credentials used against it.
#[derive(Debug, Clone, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

/// A user entry together with its name.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedAuthInfo {
    pub name: String,
    pub user: AuthInfo,
}

/// Credential material for one user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default, rename = "client-certificate")]
    pub client_certificate: Option<PathBuf>,

    #[serde(default, rename = "client-certificate-data")]
    pub client_certificate_data: Option<String>,

    #[serde(default, rename = "client-key")]
    pub client_key: Option<PathBuf>,

    #[serde(default, rename = "client-key-data")]
    pub client_key_data: Option<String>,
}

impl Kubeconfig {
    /// Load and parse a kubeconfig from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse a kubeconfig from a YAML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.cluster)
    }

    pub fn user(&self, name: &str) -> Option<&AuthInfo> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev
  cluster:
    server: https://dev.example.com:6443
    certificate-authority-data: Zm9vYmFy
- name: prod
  cluster:
    server: https://prod.example.com:6443
    insecure-skip-tls-verify: true
contexts:
- name: dev
  context:
    cluster: dev
    user: dev
- name: prod
  context:
    cluster: prod
    user: prod
users:
- name: dev
  user:
    token: abc123
- name: prod
  user:
    client-certificate: /etc/certs/prod.crt
    client-key: /etc/certs/prod.key
"#;

    #[test]
    fn parses_standard_fields() {
        let kc = Kubeconfig::parse(SAMPLE).unwrap();
        assert_eq!(kc.clusters.len(), 2);
        assert_eq!(kc.contexts.len(), 2);
        assert_eq!(kc.current_context.as_deref(), Some("dev"));

        let dev = kc.cluster("dev").unwrap();
        assert_eq!(dev.server, "https://dev.example.com:6443");
        assert_eq!(dev.certificate_authority_data.as_deref(), Some("Zm9vYmFy"));
        assert!(!dev.insecure_skip_tls_verify);

        let prod = kc.cluster("prod").unwrap();
        assert!(prod.insecure_skip_tls_verify);

        assert_eq!(kc.user("dev").unwrap().token.as_deref(), Some("abc123"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let kc = Kubeconfig::parse(
            "apiVersion: v1\npreferences: {colors: true}\nclusters: []\n",
        )
        .unwrap();
        assert!(kc.clusters.is_empty());
    }

    #[test]
    fn missing_lookup_returns_none() {
        let kc = Kubeconfig::parse(SAMPLE).unwrap();
        assert!(kc.cluster("staging").is_none());
        assert!(kc.user("staging").is_none());
    }
}
