//! The network boundary: fetching data files and assets.
//!
//! [`DataSource`] is the seam every component fetches through. [`HttpSource`]
//! talks to a real server with `reqwest`; [`MemorySource`] serves canned
//! responses for tests and local development, and can be switched offline.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::FetchError;

/// A streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// HTTP method subset the feed engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
}

/// A request for a data file or asset.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Absolute URL, or a path resolved against the source's base URL.
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A response whose body has not been read yet.
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: BodyStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

impl FetchResponse {
    /// Build a response around an in-memory body delivered in one chunk.
    pub fn from_bytes(
        url: impl Into<String>,
        status: u16,
        headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Self {
        Self {
            url: url.into(),
            status,
            headers,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Drain the body into a single buffer.
    pub async fn bytes(mut self) -> Result<Bytes, FetchError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Anything that can answer fetches for data files and assets.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Issue the request; non-2xx statuses are returned, not raised.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;

    /// Human-readable origin, used in logs.
    fn origin(&self) -> &str;
}

/// Request timeout of [`HttpSource::new`].
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// [`DataSource`] over HTTP(S) using `reqwest`.
///
/// gzip, brotli and deflate bodies are negotiated and decoded by the client.
pub struct HttpSource {
    client: reqwest::Client,
    base: url::Url,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        Self::with_timeout(base_url, DEFAULT_HTTP_TIMEOUT)
    }

    /// Source whose requests, body included, give up after `timeout`.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let base = url::Url::parse(base_url).map_err(|e| FetchError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| FetchError::Network {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn request_error(&self, url: &url::Url, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }

    /// Resolve a request URL against the base.
    pub fn resolve(&self, target: &str) -> Result<url::Url, FetchError> {
        let joined = if target.starts_with("http://") || target.starts_with("https://") {
            url::Url::parse(target)
        } else {
            self.base.join(target.trim_start_matches('/'))
        };
        joined.map_err(|e| FetchError::InvalidUrl {
            url: target.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl DataSource for HttpSource {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = self.resolve(&request.url)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
        };
        let mut builder = self.client.request(method, url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.request_error(&url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body_url = url.to_string();
        let timeout_ms = self.timeout.as_millis() as u64;
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| {
                    if e.is_timeout() {
                        FetchError::Timeout {
                            url: body_url.clone(),
                            timeout_ms,
                        }
                    } else {
                        FetchError::Body {
                            url: body_url.clone(),
                            message: e.to_string(),
                        }
                    }
                })
            })
            .boxed();

        Ok(FetchResponse {
            url: url.to_string(),
            status,
            headers,
            body,
        })
    }

    fn origin(&self) -> &str {
        self.base.as_str()
    }
}

/// A canned response served by [`MemorySource`].
#[derive(Debug, Clone)]
pub struct MemoryRoute {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl MemoryRoute {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut headers = BTreeMap::new();
        headers.insert("content-length".to_string(), body.len().to_string());
        Self {
            status: 200,
            headers,
            body,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }
}

/// In-memory [`DataSource`] for tests and local development.
///
/// Paths are matched with any leading `/` removed, so `/data/x.json` and
/// `data/x.json` address the same route. Bodies are delivered in
/// `chunk_size` pieces to exercise streaming consumers.
pub struct MemorySource {
    routes: Mutex<HashMap<String, MemoryRoute>>,
    hits: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
    latency: Option<Duration>,
    chunk_size: usize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            latency: None,
            chunk_size: 64 * 1024,
        }
    }

    /// Delay every response by `latency` (uses the tokio clock).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Split bodies into chunks of this many bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn insert(&self, path: &str, route: MemoryRoute) {
        lock(&self.routes).insert(normalize_path(path), route);
    }

    pub fn remove(&self, path: &str) {
        lock(&self.routes).remove(&normalize_path(path));
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches issued for `path`, including failed ones.
    pub fn hits(&self, path: &str) -> usize {
        lock(&self.hits)
            .get(&normalize_path(path))
            .copied()
            .unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let key = normalize_path(&request.url);
        *lock(&self.hits).entry(key.clone()).or_insert(0) += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network {
                url: request.url,
                message: "network unreachable".to_string(),
            });
        }

        let route = lock(&self.routes)
            .get(&key)
            .cloned()
            .unwrap_or_else(|| MemoryRoute::status(404));

        let body = if request.method == Method::Head {
            Bytes::new()
        } else {
            route.body
        };
        let chunks: Vec<Result<Bytes, FetchError>> = if body.is_empty() {
            Vec::new()
        } else {
            (0..body.len())
                .step_by(self.chunk_size)
                .map(|start| {
                    let end = (start + self.chunk_size).min(body.len());
                    Ok(body.slice(start..end))
                })
                .collect()
        };

        Ok(FetchResponse {
            url: request.url,
            status: route.status,
            headers: route.headers,
            body: stream::iter(chunks).boxed(),
        })
    }

    fn origin(&self) -> &str {
        "memory://"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_serves_route_in_chunks() {
        let source = MemorySource::new().with_chunk_size(4);
        source.insert("/data/2025-07.jsonl", MemoryRoute::ok("0123456789"));

        let resp = source
            .fetch(FetchRequest::get("data/2025-07.jsonl"))
            .await
            .unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.content_length(), Some(10));

        let chunks: Vec<_> = resp.body.collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(source.hits("data/2025-07.jsonl"), 1);
    }

    #[tokio::test]
    async fn test_memory_source_missing_route_is_404() {
        let source = MemorySource::new();
        let resp = source.fetch(FetchRequest::get("nope.json")).await.unwrap();
        assert_eq!(resp.status, 404);
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn test_memory_source_offline() {
        let source = MemorySource::new();
        source.insert("a.json", MemoryRoute::ok("[]"));
        source.set_offline(true);
        let err = source.fetch(FetchRequest::get("a.json")).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
        assert_eq!(source.hits("a.json"), 1);

        source.set_offline(false);
        let body = source
            .fetch(FetchRequest::get("a.json"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn test_memory_source_survives_poisoned_lock() {
        let source = std::sync::Arc::new(MemorySource::new());
        source.insert("a.json", MemoryRoute::ok("[]"));
        let poisoner = source.clone();
        let _ = std::thread::spawn(move || {
            let _routes = poisoner.routes.lock().unwrap();
            let _hits = poisoner.hits.lock().unwrap();
            panic!("poison the route table");
        })
        .join();
        assert!(source.routes.is_poisoned());

        source.insert("b.json", MemoryRoute::ok("{}"));
        let body = source
            .fetch(FetchRequest::get("b.json"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[..], b"{}");
        assert_eq!(source.hits("b.json"), 1);
        source.remove("a.json");
    }

    #[tokio::test]
    async fn test_head_request_has_no_body() {
        let source = MemorySource::new();
        source.insert("a.json", MemoryRoute::ok("[1,2,3]"));
        let request = FetchRequest {
            method: Method::Head,
            ..FetchRequest::get("a.json")
        };
        let resp = source.fetch(request).await.unwrap();
        assert_eq!(resp.content_length(), Some(7));
        assert!(resp.bytes().await.unwrap().is_empty());
    }

    #[test]
    fn test_http_source_resolves_relative_paths() {
        let source = HttpSource::new("https://example.org/feed/").unwrap();
        assert_eq!(
            source.resolve("/data/2025-07.jsonl").unwrap().as_str(),
            "https://example.org/feed/data/2025-07.jsonl"
        );
        assert_eq!(
            source.resolve("https://cdn.example.com/x.css").unwrap().as_str(),
            "https://cdn.example.com/x.css"
        );
    }

    #[test]
    fn test_http_source_rejects_bad_base() {
        assert!(matches!(
            HttpSource::new("not a url"),
            Err(FetchError::InvalidUrl { .. })
        ));
    }
}
