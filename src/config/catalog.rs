//! The upstream catalog: one immutable entry per kubeconfig context.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io};

use base64::prelude::*;

use crate::config::kubeconfig::Kubeconfig;
use crate::config::ConfigError;

/// PEM material referenced either by path or inlined in the kubeconfig.
///
/// Inline (`*-data`) variants are base64-decoded at catalog build time, so a
/// `Data` source always holds raw PEM bytes.
#[derive(Debug, Clone)]
pub enum PemSource {
    File(PathBuf),
    Data(Vec<u8>),
}

impl PemSource {
    /// Read the PEM bytes, hitting the filesystem for `File` sources.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        match self {
            PemSource::File(path) => fs::read(path),
            PemSource::Data(bytes) => Ok(bytes.clone()),
        }
    }
}

/// One configured upstream API server and its credentials.
///
/// Immutable after load; identified by `name`.
#[derive(Debug, Clone)]
pub struct UpstreamContext {
    pub name: String,
    pub server: String,
    pub ca: Option<PemSource>,
    pub client_cert: Option<PemSource>,
    pub client_key: Option<PemSource>,
    pub token: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Read-only map of context name → upstream, derived from the kubeconfig.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    upstreams: HashMap<String, Arc<UpstreamContext>>,
}

impl Catalog {
    /// Build the catalog from a parsed kubeconfig.
    ///
    /// Contexts referencing a missing cluster or user are skipped with a
    /// warning rather than failing startup, matching kubectl's tolerance for
    /// partially-populated kubeconfigs.
    pub fn from_kubeconfig(kc: &Kubeconfig) -> Result<Self, ConfigError> {
        let mut upstreams = HashMap::new();

        for named in &kc.contexts {
            let Some(cluster) = kc.cluster(&named.context.cluster) else {
                tracing::warn!(
                    context = %named.name,
                    cluster = %named.context.cluster,
                    "context references unknown cluster, skipping"
                );
                continue;
            };
            let Some(user) = kc.user(&named.context.user) else {
                tracing::warn!(
                    context = %named.name,
                    user = %named.context.user,
                    "context references unknown user, skipping"
                );
                continue;
            };

            let ca = pem_source(
                cluster.certificate_authority.clone(),
                cluster.certificate_authority_data.as_deref(),
                "certificate-authority-data",
                &named.name,
            )?;
            let client_cert = pem_source(
                user.client_certificate.clone(),
                user.client_certificate_data.as_deref(),
                "client-certificate-data",
                &named.name,
            )?;
            let client_key = pem_source(
                user.client_key.clone(),
                user.client_key_data.as_deref(),
                "client-key-data",
                &named.name,
            )?;

            upstreams.insert(
                named.name.clone(),
                Arc::new(UpstreamContext {
                    name: named.name.clone(),
                    server: cluster.server.clone(),
                    ca,
                    client_cert,
                    client_key,
                    token: user.token.clone(),
                    insecure_skip_verify: cluster.insecure_skip_tls_verify,
                }),
            );
        }

        if upstreams.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }

        Ok(Self { upstreams })
    }

    /// Look up an upstream by context name.
    pub fn get(&self, name: &str) -> Option<Arc<UpstreamContext>> {
        self.upstreams.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Names of all configured contexts.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.upstreams.keys().map(String::as_str)
    }
}

/// Resolve the file/inline-data pair for one PEM field. Inline data wins when
/// both are set, mirroring client-go precedence.
fn pem_source(
    file: Option<PathBuf>,
    data: Option<&str>,
    field: &'static str,
    name: &str,
) -> Result<Option<PemSource>, ConfigError> {
    if let Some(data) = data {
        let bytes = BASE64_STANDARD
            .decode(data)
            .map_err(|source| ConfigError::InvalidData {
                field,
                name: name.to_string(),
                source,
            })?;
        return Ok(Some(PemSource::Data(bytes)));
    }
    Ok(file.map(PemSource::File))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Kubeconfig {
        Kubeconfig::parse(
            r#"
clusters:
- name: dev
  cluster:
    server: https://dev.example.com:6443
    certificate-authority-data: LS0tLS1CRUdJTg==
contexts:
- name: dev
  context: {cluster: dev, user: dev}
- name: dangling
  context: {cluster: nosuch, user: dev}
users:
- name: dev
  user: {token: tok}
"#,
        )
        .unwrap()
    }

    #[test]
    fn builds_entries_and_skips_dangling_contexts() {
        let catalog = Catalog::from_kubeconfig(&sample()).unwrap();
        assert_eq!(catalog.len(), 1);

        let dev = catalog.get("dev").unwrap();
        assert_eq!(dev.server, "https://dev.example.com:6443");
        assert_eq!(dev.token.as_deref(), Some("tok"));
        assert!(catalog.get("dangling").is_none());
    }

    #[test]
    fn inline_data_is_base64_decoded() {
        let catalog = Catalog::from_kubeconfig(&sample()).unwrap();
        let dev = catalog.get("dev").unwrap();
        match dev.ca.as_ref().unwrap() {
            PemSource::Data(bytes) => assert_eq!(bytes, b"-----BEGIN"),
            other => panic!("expected inline data, got {other:?}"),
        }
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let kc = Kubeconfig::parse(
            r#"
clusters:
- name: dev
  cluster:
    server: https://dev.example.com:6443
    certificate-authority-data: "%%%not-base64%%%"
contexts:
- name: dev
  context: {cluster: dev, user: dev}
users:
- name: dev
  user: {token: tok}
"#,
        )
        .unwrap();
        assert!(matches!(
            Catalog::from_kubeconfig(&kc),
            Err(ConfigError::InvalidData { .. })
        ));
    }

    #[test]
    fn empty_catalog_is_an_error() {
        let kc = Kubeconfig::default();
        assert!(matches!(
            Catalog::from_kubeconfig(&kc),
            Err(ConfigError::EmptyCatalog)
        ));
    }
}
