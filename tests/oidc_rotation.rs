//! OIDC validation against a fake issuer, including key rotation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;
use tokio::net::TcpListener;

use multikube::auth::{Jwks, OidcValidator};
use multikube::config::OidcOptions;

mod common;
use common::{
    client, discovery_document, jwks_document, single_context_catalog, spawn_proxy, wait_for,
    TestKey, Upstream, POD_LIST,
};

/// A fake OIDC provider serving discovery plus a swappable JWKS.
struct Issuer {
    url: String,
    keys: Arc<Mutex<Jwks>>,
}

impl Issuer {
    async fn spawn(initial: Jwks) -> Self {
        let keys = Arc::new(Mutex::new(initial));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let app = Router::new()
            .route(
                "/.well-known/openid-configuration",
                get({
                    let url = url.clone();
                    move || {
                        let url = url.clone();
                        async move { Json(discovery_document(&url, &format!("{url}/keys"))) }
                    }
                }),
            )
            .route(
                "/keys",
                get(|State(keys): State<Arc<Mutex<Jwks>>>| async move {
                    let snapshot = keys.lock().unwrap().clone();
                    Json(jwks_document(&snapshot))
                }),
            )
            .with_state(Arc::clone(&keys));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, keys }
    }

    fn rotate(&self, jwks: Jwks) {
        *self.keys.lock().unwrap() = jwks;
    }
}

fn oidc_validator(issuer_url: &str) -> Arc<OidcValidator> {
    Arc::new(
        OidcValidator::new(&OidcOptions {
            issuer_url: issuer_url.to_string(),
            poll_interval: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn jwks_rotation_invalidates_old_tokens() {
    let key_a = TestKey::generate();
    let key_b = TestKey::generate();

    let issuer = Issuer::spawn(Jwks {
        keys: vec![key_a.jwk("key-a")],
    })
    .await;

    let validator = oidc_validator(&issuer.url);
    validator.spawn_poller();

    let upstream = Upstream::spawn(StatusCode::OK, POD_LIST).await;
    let catalog = single_context_catalog("dev", &upstream.server_url(), "tok");
    let proxy = spawn_proxy(catalog, None, Some(validator), Duration::ZERO).await;

    let http = client();
    let url = format!("http://{proxy}/dev/api/v1/pods");
    let token_a = key_a.mint("alice", Some("key-a"));
    let token_b = key_b.mint("bob", Some("key-b"));

    // Wait for the first successful poll, then key A verifies.
    assert!(
        wait_for(
            || async {
                http.get(&url)
                    .bearer_auth(&token_a)
                    .send()
                    .await
                    .unwrap()
                    .status()
                    == StatusCode::OK
            },
            Duration::from_secs(5),
        )
        .await,
        "token signed by key A should verify once the initial JWKS is polled"
    );

    // Key B is not published yet.
    let res = http.get(&url).bearer_auth(&token_b).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    issuer.rotate(Jwks {
        keys: vec![key_b.jwk("key-b")],
    });

    // After rotation key B verifies and key A is rejected with an unknown
    // key id.
    assert!(
        wait_for(
            || async {
                http.get(&url)
                    .bearer_auth(&token_b)
                    .send()
                    .await
                    .unwrap()
                    .status()
                    == StatusCode::OK
            },
            Duration::from_secs(5),
        )
        .await,
        "token signed by key B should verify after rotation"
    );

    let res = http.get(&url).bearer_auth(&token_a).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = res.text().await.unwrap();
    assert!(body.contains("key id invalid"), "body: {body}");

    // The upstream only ever saw authenticated, impersonated traffic.
    assert!(upstream
        .requests()
        .iter()
        .all(|r| r.headers.contains_key("impersonate-user")));
}

#[tokio::test]
async fn requests_before_first_poll_fail_401() {
    let key = TestKey::generate();

    // Point the validator at a black hole so no poll ever succeeds.
    let validator = oidc_validator("http://127.0.0.1:9");

    let upstream = Upstream::spawn(StatusCode::OK, POD_LIST).await;
    let catalog = single_context_catalog("dev", &upstream.server_url(), "tok");
    let proxy = spawn_proxy(catalog, None, Some(validator), Duration::ZERO).await;

    let res = client()
        .get(format!("http://{proxy}/dev/api/v1/pods"))
        .bearer_auth(key.mint("alice", Some("key-a")))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(upstream.request_count(), 0);
}

#[tokio::test]
async fn username_claim_is_configurable() {
    let key = TestKey::generate();

    let validator = Arc::new(
        OidcValidator::new(&OidcOptions {
            issuer_url: "http://unused.example.com".to_string(),
            username_claim: "email".to_string(),
            ..Default::default()
        })
        .unwrap(),
    );
    // Seed the key set directly instead of waiting out a poll cycle.
    validator.set_keys(Jwks {
        keys: vec![key.jwk("key-a")],
    });

    let upstream = Upstream::spawn(StatusCode::OK, POD_LIST).await;
    let catalog = single_context_catalog("dev", &upstream.server_url(), "tok");
    let proxy = spawn_proxy(catalog, None, Some(validator), Duration::ZERO).await;

    let token = key.mint_with_claims(
        serde_json::json!({ "sub": "ignored", "email": "carol@example.com" }),
        Some("key-a"),
    );
    let res = client()
        .get(format!("http://{proxy}/dev/api/v1/pods"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        upstream.requests()[0].headers.get("impersonate-user").unwrap(),
        "carol@example.com"
    );
}
