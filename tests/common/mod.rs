//! Shared utilities for the integration tests: throwaway RSA keypairs, JWT
//! minting, a recording mock upstream, and proxy spin-up helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::Request;
use axum::response::IntoResponse;
use axum::Router;
use base64::prelude::*;
use http::{HeaderMap, StatusCode};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::net::TcpListener;

use multikube::auth::{Jwk, Jwks, OidcValidator, Rs256Validator};
use multikube::config::{Catalog, Kubeconfig, TransportOptions};
use multikube::server::build_router;
use multikube::ProxyService;

/// An RSA keypair in the encodings the proxy and the tests need.
pub struct TestKey {
    pub private_pem: String,
    pub public_pem: String,
    pub jwk_n: String,
}

impl TestKey {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("RSA key generation");
        let public = RsaPublicKey::from(&private);
        Self {
            private_pem: private
                .to_pkcs8_pem(LineEnding::LF)
                .expect("PKCS#8 encoding")
                .to_string(),
            public_pem: public
                .to_public_key_pem(LineEnding::LF)
                .expect("SPKI encoding"),
            jwk_n: BASE64_URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        }
    }

    /// Mint an RS256 JWT with the given subject and optional key id.
    pub fn mint(&self, subject: &str, kid: Option<&str>) -> String {
        self.mint_with_claims(serde_json::json!({ "sub": subject }), kid)
    }

    /// Mint an RS256 JWT with arbitrary claims; `exp` is filled in when the
    /// caller did not set one.
    pub fn mint_with_claims(&self, mut claims: serde_json::Value, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        if claims.get("exp").is_none() {
            let exp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs()
                + 3600;
            claims["exp"] = serde_json::json!(exp);
        }
        let key = EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).expect("signing key");
        jsonwebtoken::encode(&header, &claims, &key).expect("JWT minting")
    }

    /// The JWK advertising this key under the given key id.
    pub fn jwk(&self, kid: &str) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            kid: kid.to_string(),
            n: self.jwk_n.clone(),
            e: "AQAB".to_string(),
            ..Default::default()
        }
    }

    pub fn validator(&self) -> Arc<Rs256Validator> {
        Arc::new(Rs256Validator::from_pem(self.public_pem.as_bytes()).expect("validator"))
    }
}

/// One request as observed by the mock upstream.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

/// A mock API server that records every request and answers with a fixed
/// response.
pub struct Upstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl Upstream {
    pub async fn spawn(status: StatusCode, body: &'static str) -> Self {
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&requests);

        let app = Router::new().fallback(move |req: Request| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().unwrap().push(RecordedRequest {
                    method: req.method().to_string(),
                    path: req.uri().path().to_string(),
                    query: req.uri().query().map(str::to_string),
                    headers: req.headers().clone(),
                });
                (status, body).into_response()
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, requests }
    }

    pub fn server_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// A catalog with a single context pointing at the given server.
pub fn single_context_catalog(name: &str, server: &str, token: &str) -> Catalog {
    let yaml = format!(
        r#"
apiVersion: v1
kind: Config
current-context: {name}
clusters:
- name: {name}
  cluster:
    server: {server}
contexts:
- name: {name}
  context:
    cluster: {name}
    user: {name}
users:
- name: {name}
  user:
    token: {token}
"#
    );
    Catalog::from_kubeconfig(&Kubeconfig::parse(&yaml).unwrap()).unwrap()
}

/// Start the proxy on an ephemeral port with the given validators.
pub async fn spawn_proxy(
    catalog: Catalog,
    rs256: Option<Arc<Rs256Validator>>,
    oidc: Option<Arc<OidcValidator>>,
    cache_ttl: Duration,
) -> SocketAddr {
    let service = Arc::new(ProxyService::new(
        catalog,
        TransportOptions {
            cache_ttl,
            ..Default::default()
        },
    ));
    let router = build_router(service, rs256, oidc);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Test HTTP client that ignores any proxy configured in the environment.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("reqwest client")
}

/// Poll until `probe` returns true or the deadline passes.
pub async fn wait_for<F, Fut>(mut probe: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if probe().await {
            return true;
        }
        if started.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A serialized "empty pod list" body, close enough to what a kube-apiserver
/// returns for a list request.
pub const POD_LIST: &str =
    r#"{"apiVersion":"v1","items":[],"kind":"List","metadata":{"resourceVersion":"","selfLink":""}}"#;

/// The JSON an OIDC discovery endpoint serves, pointed at `jwks_uri`.
pub fn discovery_document(issuer: &str, jwks_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "issuer": issuer,
        "jwks_uri": jwks_uri,
    })
}

/// Serialize a JWKS the way a provider publishes it.
pub fn jwks_document(jwks: &Jwks) -> serde_json::Value {
    serde_json::to_value(jwks).unwrap()
}
