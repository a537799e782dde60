//! TTL-bounded response cache, one instance per upstream context.
//!
//! Expiry is lazy: there is no background eviction task. An expired entry is
//! indistinguishable from a missing one and is purged by the `get` that
//! observes it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;

/// Response header announcing that a response was served from cache. The
/// value is the age of the cached entry.
pub static CACHE_AGE_HEADER: HeaderName = HeaderName::from_static("multikube-cache-age");

/// A complete upstream response held in cache: status, headers and body
/// bytes. Headers keep their original order, duplicates included.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &http::HeaderMap, body: Bytes) -> Self {
        let mut flat = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            flat.push((name.clone(), value.clone()));
        }
        Self {
            status,
            headers: flat,
            body,
        }
    }

    /// Number of bytes held by this entry (body plus header text).
    pub fn bytes(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.as_str().len() + v.len())
                .sum::<usize>()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Materialize an HTTP response carrying `Multikube-Cache-Age`. Each call
    /// produces an independent response; the stored entry is not consumed.
    pub fn to_response(&self, age: Duration) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        for (name, value) in &self.headers {
            response.headers_mut().append(name.clone(), value.clone());
        }
        let age_value = HeaderValue::from_str(&format!("{age:?}"))
            .unwrap_or_else(|_| HeaderValue::from_static("0s"));
        response
            .headers_mut()
            .insert(CACHE_AGE_HEADER.clone(), age_value);
        response
    }
}

#[derive(Debug)]
struct Entry {
    value: CachedResponse,
    created: Instant,
    expires: Instant,
}

/// Thread-safe key → response store with TTL expiry.
///
/// Keys are full upstream request URLs including the query string. All
/// operations take the internal mutex; none of them block on I/O.
#[derive(Debug)]
pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl Cache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch an entry and its current age. Returns `None` for absent or
    /// expired keys; an expired entry is removed as a side effect.
    pub fn get(&self, key: &str) -> Option<(CachedResponse, Duration)> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if now < entry.expires => {
                Some((entry.value.clone(), now.duration_since(entry.created)))
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or replace an entry, stamping creation and expiry times.
    pub fn set(&self, key: &str, value: CachedResponse) {
        let now = Instant::now();
        let entry = Entry {
            value,
            created: now,
            expires: now + self.ttl,
        };
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .insert(key.to_string(), entry);
    }

    /// Remove an entry. Removing a missing key is a no-op.
    pub fn delete(&self, key: &str) {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .remove(key);
    }

    /// Keys of all live entries. Expired entries are purged first.
    pub fn list_keys(&self) -> Vec<String> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        entries.retain(|_, e| now < e.expires);
        entries.keys().cloned().collect()
    }

    /// Count of live entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        entries.retain(|_, e| now < e.expires);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes held by live entries.
    pub fn size(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        entries.retain(|_, e| now < e.expires);
        entries.values().map(|e| e.value.bytes()).sum()
    }
}

/// Whether a request URL may be served from or stored into the cache.
///
/// `watch=true` and `follow=true` mark long-lived Kubernetes streams; caching
/// those would hand clients a truncated snapshot of an endless response.
pub fn is_cacheable_url(uri: &http::Uri) -> bool {
    let Some(query) = uri.query() else {
        return true;
    };
    !query.split('&').any(|pair| {
        matches!(
            pair.split_once('='),
            Some(("watch", "true")) | Some(("follow", "true"))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> CachedResponse {
        CachedResponse::new(StatusCode::OK, &http::HeaderMap::new(), Bytes::from(body.to_string()))
    }

    #[test]
    fn set_then_get_within_ttl() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.set("/api/v1/pods", response("pods"));

        let (hit, age) = cache.get("/api/v1/pods").unwrap();
        assert_eq!(hit.body(), "pods");
        assert!(age < Duration::from_secs(1));
    }

    #[test]
    fn expired_entries_are_invisible_and_purged() {
        let cache = Cache::new(Duration::from_millis(10));
        cache.set("k", response("v"));
        std::thread::sleep(Duration::from_millis(20));

        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_replaces_existing_entry() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.set("k", response("old"));
        cache.set("k", response("new"));

        let (hit, _) = cache.get("k").unwrap();
        assert_eq!(hit.body(), "new");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.set("k", response("v"));
        cache.delete("k");
        cache.delete("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn len_and_size_track_live_entries() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.set("a", response("foo"));
        cache.set("b", response("quux"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size(), 7);

        let mut keys = cache.list_keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn cached_response_is_independent_per_hit() {
        let cache = Cache::new(Duration::from_secs(60));
        let mut headers = http::HeaderMap::new();
        headers.append("x-one", HeaderValue::from_static("1"));
        headers.append("x-one", HeaderValue::from_static("2"));
        cache.set(
            "k",
            CachedResponse::new(StatusCode::OK, &headers, Bytes::from_static(b"body")),
        );

        let (first, age) = cache.get("k").unwrap();
        let (second, _) = cache.get("k").unwrap();
        let a = first.to_response(age);
        let b = second.to_response(age);
        assert_eq!(
            a.headers().get_all("x-one").iter().count(),
            b.headers().get_all("x-one").iter().count()
        );
        assert!(a.headers().contains_key(&CACHE_AGE_HEADER));
    }

    #[test]
    fn watch_and_follow_queries_are_not_cacheable() {
        let ok: http::Uri = "https://host/api/v1/pods?limit=500".parse().unwrap();
        let watch: http::Uri = "https://host/api/v1/pods?watch=true".parse().unwrap();
        let follow: http::Uri = "https://host/api/v1/pods/log?follow=true".parse().unwrap();
        let negated: http::Uri = "https://host/api/v1/pods?watch=false".parse().unwrap();

        assert!(is_cacheable_url(&ok));
        assert!(!is_cacheable_url(&watch));
        assert!(!is_cacheable_url(&follow));
        assert!(is_cacheable_url(&negated));
    }
}
