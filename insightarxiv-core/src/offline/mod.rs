//! Offline cache for static assets and data files.
//!
//! [`OfflineCache`] sits between a client and the network and answers
//! fetches with one of four strategies chosen from the request URL:
//!
//! - static assets: cache-first, refreshing the cached copy in the background
//! - data files: network-first, falling back to the cache and then to a
//!   JSON `503` body
//! - other same-origin requests: stale-while-revalidate
//! - cross-origin requests: any cache, then the network
//!
//! Caches are versioned by name; activation deletes every cache that does
//! not belong to the current version. [`server`] exposes the cache as an
//! HTTP proxy.

pub mod protocol;
pub mod server;
pub mod store;

pub use protocol::{CacheInfo, ControlMessage, ControlReply};
pub use store::{CacheStorage, CachedResponse};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{FetchError, OfflineError};
use crate::source::{DataSource, FetchRequest, FetchResponse, Method};

/// Body of the text fallback served when neither cache nor network answers.
pub const OFFLINE_TEXT: &str = "Offline - Resource unavailable";

/// Configuration for the offline cache and its proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Prefix of every cache name.
    pub cache_prefix: String,
    /// Version tag; caches of other versions are pruned on activation.
    pub version: String,
    /// Assets fetched into the static cache on install. Absolute URLs are
    /// fetched best-effort.
    pub static_assets: Vec<String>,
    /// Path fragments always served cache-first.
    pub cache_first_paths: Vec<String>,
    /// Path fragments served network-first.
    pub network_first_paths: Vec<String>,
    pub static_extensions: Vec<String>,
    pub data_extensions: Vec<String>,
    /// Proxy listen address.
    pub host: String,
    pub port: u16,
    /// Upstream origin the proxy fetches from; defaults to `data.base_url`.
    #[serde(default)]
    pub upstream: Option<String>,
    /// Mirror caches to this directory so they survive restarts.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            cache_prefix: "insightarxiv".to_string(),
            version: "v1.0.0".to_string(),
            static_assets: strings(&[
                "/",
                "/index.html",
                "/style.css",
                "/app.js",
                "/json-parser-worker.js",
            ]),
            cache_first_paths: strings(&["/style.css", "/app.js", "/json-parser-worker.js"]),
            network_first_paths: strings(&["/data/", "database.json"]),
            static_extensions: strings(&[".css", ".js", ".png", ".jpg", ".svg", ".ico"]),
            data_extensions: strings(&[".json", ".jsonl"]),
            host: "127.0.0.1".to_string(),
            port: 8787,
            upstream: None,
            persist_dir: None,
        }
    }
}

impl OfflineConfig {
    /// Runtime cache, also reported as the version.
    pub fn runtime_cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    pub fn static_cache_name(&self) -> String {
        format!("{}-static-{}", self.cache_prefix, self.version)
    }

    pub fn data_cache_name(&self) -> String {
        format!("{}-data-{}", self.cache_prefix, self.version)
    }

    /// Every cache name belonging to the current version.
    pub fn current_cache_names(&self) -> [String; 3] {
        [
            self.runtime_cache_name(),
            self.static_cache_name(),
            self.data_cache_name(),
        ]
    }

    pub fn is_static_path(&self, path: &str) -> bool {
        self.cache_first_paths.iter().any(|p| path.contains(p.as_str()))
            || self
                .static_extensions
                .iter()
                .any(|ext| path.ends_with(ext.as_str()))
    }

    pub fn is_data_path(&self, path: &str) -> bool {
        self.network_first_paths
            .iter()
            .any(|p| path.contains(p.as_str()))
            || self
                .data_extensions
                .iter()
                .any(|ext| path.ends_with(ext.as_str()))
    }
}

/// Which strategy answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    Static,
    Data,
    SameOrigin,
    External,
}

/// Lifecycle of the cache set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Created, nothing installed yet.
    Parsed,
    Installing,
    /// Installed and waiting to take over.
    Installed,
    Activated,
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedFrom {
    Network,
    Cache,
    /// Synthesized offline response.
    Fallback,
}

impl ServedFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            ServedFrom::Network => "network",
            ServedFrom::Cache => "cache",
            ServedFrom::Fallback => "fallback",
        }
    }
}

/// A response together with its provenance.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub response: CachedResponse,
    pub served_from: ServedFrom,
}

impl ServedResponse {
    fn network(response: CachedResponse) -> Self {
        Self {
            response,
            served_from: ServedFrom::Network,
        }
    }

    fn cache(response: CachedResponse) -> Self {
        Self {
            response,
            served_from: ServedFrom::Cache,
        }
    }

    fn unavailable() -> Self {
        Self {
            response: CachedResponse::text(503, OFFLINE_TEXT),
            served_from: ServedFrom::Fallback,
        }
    }

    fn data_unavailable() -> Self {
        Self {
            response: CachedResponse::json(
                503,
                &serde_json::json!({
                    "error": "Offline",
                    "message": "Data unavailable offline",
                }),
            ),
            served_from: ServedFrom::Fallback,
        }
    }
}

/// Outcome of pre-caching the static assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Same-origin assets.
    pub total: usize,
    pub cached: usize,
    pub failed: Vec<String>,
    /// Absolute-URL assets, cached best-effort.
    pub external_cached: usize,
    pub external_failed: Vec<String>,
}

impl InstallReport {
    /// `Err` when some asset could not be pre-cached.
    pub fn ensure_complete(&self) -> Result<(), OfflineError> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(OfflineError::Precache {
                failed: self.failed.len(),
                total: self.total,
            })
        }
    }
}

/// Snapshot reported by the proxy health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OfflineStatus {
    pub lifecycle: Lifecycle,
    pub version: String,
    pub caches: Vec<CacheInfo>,
}

fn is_absolute_url(asset: &str) -> bool {
    asset.starts_with("http://") || asset.starts_with("https://")
}

#[derive(Debug, Clone)]
struct Target {
    url: Url,
    same_origin: bool,
}

impl Target {
    fn key(&self) -> &str {
        self.url.as_str()
    }

    /// What to ask the network for: the path for same-origin requests, the
    /// full URL otherwise.
    fn network_url(&self) -> String {
        if self.same_origin {
            match self.url.query() {
                Some(query) => format!("{}?{}", self.url.path(), query),
                None => self.url.path().to_string(),
            }
        } else {
            self.url.to_string()
        }
    }
}

/// The offline cache. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct OfflineCache {
    inner: Arc<OfflineInner>,
}

struct OfflineInner {
    config: OfflineConfig,
    origin: Url,
    network: Arc<dyn DataSource>,
    storage: Arc<CacheStorage>,
    lifecycle: RwLock<Lifecycle>,
    background: TaskTracker,
}

impl OfflineCache {
    /// `origin` is the URL clients reach the cache at; request paths are
    /// resolved against it.
    pub fn new(
        config: OfflineConfig,
        origin: &str,
        network: Arc<dyn DataSource>,
        storage: Arc<CacheStorage>,
    ) -> Result<Self, OfflineError> {
        let origin = Url::parse(origin).map_err(|e| OfflineError::InvalidUrl {
            url: origin.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            inner: Arc::new(OfflineInner {
                config,
                origin,
                network,
                storage,
                lifecycle: RwLock::new(Lifecycle::Parsed),
                background: TaskTracker::new(),
            }),
        })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.inner.storage
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.read().await
    }

    /// Strategy for `url`. Static wins over data.
    pub fn classify(&self, url: &Url) -> RequestClass {
        let config = &self.inner.config;
        let path = url.path();
        if config.is_static_path(path) {
            RequestClass::Static
        } else if config.is_data_path(path) {
            RequestClass::Data
        } else if url.origin() == self.inner.origin.origin() {
            RequestClass::SameOrigin
        } else {
            RequestClass::External
        }
    }

    /// Restore persisted caches, then install and activate.
    pub async fn start(&self) -> Result<InstallReport, OfflineError> {
        let restored = self.inner.storage.restore().await?;
        if restored > 0 {
            info!(restored, "Restored persisted caches");
        }
        self.install().await
    }

    /// Pre-cache the static assets. Failed assets are reported, not fatal.
    /// Absolute-URL assets are best-effort and never count against
    /// [`InstallReport::ensure_complete`]. Skips waiting, so the new version
    /// activates straight away.
    pub async fn install(&self) -> Result<InstallReport, OfflineError> {
        *self.inner.lifecycle.write().await = Lifecycle::Installing;
        let cache_name = self.inner.config.static_cache_name();
        self.inner.storage.open(&cache_name).await;

        let (external, local): (Vec<&String>, Vec<&String>) = self
            .inner
            .config
            .static_assets
            .iter()
            .partition(|asset| is_absolute_url(asset));
        let (local_outcomes, external_outcomes) = tokio::join!(
            join_all(local.iter().map(|asset| self.precache(&cache_name, asset))),
            join_all(external.iter().map(|asset| self.precache(&cache_name, asset))),
        );

        let mut report = InstallReport {
            total: local.len(),
            ..InstallReport::default()
        };
        for (asset, ok) in local.into_iter().zip(local_outcomes) {
            if ok {
                report.cached += 1;
            } else {
                report.failed.push(asset.clone());
            }
        }
        for (asset, ok) in external.into_iter().zip(external_outcomes) {
            if ok {
                report.external_cached += 1;
            } else {
                report.external_failed.push(asset.clone());
            }
        }
        if report.failed.is_empty() {
            info!(cached = report.cached, cache = %cache_name, "Static assets cached");
        } else {
            warn!(
                failed = report.failed.len(),
                total = report.total,
                "Some static assets could not be cached"
            );
        }
        if !report.external_failed.is_empty() {
            warn!(
                failed = ?report.external_failed,
                "External assets not cached; they will be fetched on demand"
            );
        }

        *self.inner.lifecycle.write().await = Lifecycle::Installed;
        self.skip_waiting().await?;
        Ok(report)
    }

    async fn precache(&self, cache_name: &str, asset: &str) -> bool {
        let target = match self.resolve(asset) {
            Ok(target) => target,
            Err(e) => {
                warn!(asset, error = %e, "Skipping static asset");
                return false;
            }
        };
        match self.fetch_network(&target, Method::Get).await {
            Ok(response) if response.is_success() => {
                self.store(cache_name, &target, response).await;
                true
            }
            Ok(response) => {
                warn!(asset, status = response.status, "Static asset not cached");
                false
            }
            Err(e) => {
                warn!(asset, error = %e, "Static asset not cached");
                false
            }
        }
    }

    /// Activate a waiting installation. Returns whether it activated.
    pub async fn skip_waiting(&self) -> Result<bool, OfflineError> {
        if self.lifecycle().await == Lifecycle::Installed {
            self.activate().await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Delete caches of other versions and start serving from the cache.
    /// Returns the names of the deleted caches.
    pub async fn activate(&self) -> Result<Vec<String>, OfflineError> {
        let current = self.inner.config.current_cache_names();
        let mut pruned = Vec::new();
        for name in self.inner.storage.names().await {
            if !current.contains(&name) {
                info!(cache = %name, "Deleting old cache");
                self.inner.storage.delete(&name).await?;
                pruned.push(name);
            }
        }
        *self.inner.lifecycle.write().await = Lifecycle::Activated;
        info!(version = %self.inner.config.version, "Offline cache activated");
        Ok(pruned)
    }

    /// Answer a request.
    ///
    /// Only an unparsable URL is an error; network failures become cached
    /// or synthesized responses.
    pub async fn fetch(&self, request: FetchRequest) -> Result<ServedResponse, OfflineError> {
        let target = self.resolve(&request.url)?;

        if request.method != Method::Get || self.lifecycle().await != Lifecycle::Activated {
            return Ok(self.passthrough(&target, request.method).await);
        }

        let config = &self.inner.config;
        let served = match self.classify(&target.url) {
            RequestClass::Static => self.cache_first(&config.static_cache_name(), target).await,
            RequestClass::Data => self.network_first(&config.data_cache_name(), target).await,
            RequestClass::SameOrigin => {
                self.stale_while_revalidate(&config.runtime_cache_name(), target)
                    .await
            }
            RequestClass::External => self.external(target).await,
        };
        Ok(served)
    }

    /// Handle a control message. `SKIP_WAITING` has no reply.
    pub async fn handle_message(
        &self,
        message: ControlMessage,
    ) -> Result<Option<ControlReply>, OfflineError> {
        debug!(?message, "Control message");
        match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting().await?;
                Ok(None)
            }
            ControlMessage::GetVersion => Ok(Some(ControlReply::Version {
                version: self.inner.config.runtime_cache_name(),
            })),
            ControlMessage::GetCacheInfo => Ok(Some(ControlReply::CacheInfo {
                version: self.inner.config.runtime_cache_name(),
                caches: self.inner.storage.info().await,
            })),
            ControlMessage::ClearCache => {
                for name in self.inner.storage.names().await {
                    self.inner.storage.delete(&name).await?;
                }
                info!("All caches cleared");
                Ok(Some(ControlReply::Cleared { success: true }))
            }
        }
    }

    pub async fn status(&self) -> OfflineStatus {
        OfflineStatus {
            lifecycle: self.lifecycle().await,
            version: self.inner.config.runtime_cache_name(),
            caches: self.inner.storage.info().await,
        }
    }

    /// Wait for every background refresh started so far.
    pub async fn settle(&self) {
        self.inner.background.close();
        self.inner.background.wait().await;
        self.inner.background.reopen();
    }

    fn resolve(&self, target: &str) -> Result<Target, OfflineError> {
        let url = self
            .inner
            .origin
            .join(target)
            .map_err(|e| OfflineError::InvalidUrl {
                url: target.to_string(),
                message: e.to_string(),
            })?;
        let same_origin = url.origin() == self.inner.origin.origin();
        Ok(Target { url, same_origin })
    }

    async fn fetch_network(
        &self,
        target: &Target,
        method: Method,
    ) -> Result<CachedResponse, FetchError> {
        let request = FetchRequest {
            method,
            ..FetchRequest::get(target.network_url())
        };
        let response = self.inner.network.fetch(request).await?;
        let status = response.status;
        let headers = response.headers.clone();
        let body = response.bytes().await?;
        Ok(CachedResponse::new(status, headers, body))
    }

    async fn store(&self, cache_name: &str, target: &Target, response: CachedResponse) {
        if let Err(e) = self
            .inner
            .storage
            .put(cache_name, target.key(), response)
            .await
        {
            warn!(cache = cache_name, url = %target.url, error = %e, "Failed to store response");
        }
    }

    fn revalidate(&self, cache_name: String, target: Target) {
        let this = self.clone();
        self.inner.background.spawn(async move {
            match this.fetch_network(&target, Method::Get).await {
                Ok(response) if response.is_success() => {
                    this.store(&cache_name, &target, response).await;
                    debug!(url = %target.url, "Cached copy refreshed");
                }
                Ok(response) => {
                    debug!(url = %target.url, status = response.status, "Refresh skipped");
                }
                Err(e) => debug!(url = %target.url, error = %e, "Refresh failed"),
            }
        });
    }

    async fn passthrough(&self, target: &Target, method: Method) -> ServedResponse {
        match self.fetch_network(target, method).await {
            Ok(response) => ServedResponse::network(response),
            Err(e) => {
                warn!(url = %target.url, error = %e, "Network unavailable");
                ServedResponse::unavailable()
            }
        }
    }

    async fn cache_first(&self, cache_name: &str, target: Target) -> ServedResponse {
        if let Some(cached) = self.inner.storage.get(cache_name, target.key()).await {
            debug!(url = %target.url, "Cache hit");
            self.revalidate(cache_name.to_string(), target);
            return ServedResponse::cache(cached);
        }
        match self.fetch_network(&target, Method::Get).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(cache_name, &target, response.clone()).await;
                }
                ServedResponse::network(response)
            }
            Err(e) => {
                warn!(url = %target.url, error = %e, "Static asset unavailable");
                ServedResponse::unavailable()
            }
        }
    }

    async fn network_first(&self, cache_name: &str, target: Target) -> ServedResponse {
        match self.fetch_network(&target, Method::Get).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(cache_name, &target, response.clone()).await;
                }
                ServedResponse::network(response)
            }
            Err(e) => {
                match self.inner.storage.get(cache_name, target.key()).await {
                    Some(cached) => {
                        info!(url = %target.url, error = %e, "Network failed, serving cached data");
                        ServedResponse::cache(cached)
                    }
                    None => {
                        warn!(url = %target.url, error = %e, "Data unavailable offline");
                        ServedResponse::data_unavailable()
                    }
                }
            }
        }
    }

    async fn stale_while_revalidate(&self, cache_name: &str, target: Target) -> ServedResponse {
        if let Some(cached) = self.inner.storage.get(cache_name, target.key()).await {
            self.revalidate(cache_name.to_string(), target);
            return ServedResponse::cache(cached);
        }
        match self.fetch_network(&target, Method::Get).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(cache_name, &target, response.clone()).await;
                }
                ServedResponse::network(response)
            }
            Err(e) => {
                warn!(url = %target.url, error = %e, "Resource unavailable");
                ServedResponse::unavailable()
            }
        }
    }

    async fn external(&self, target: Target) -> ServedResponse {
        if let Some(cached) = self.inner.storage.match_any(target.key()).await {
            return ServedResponse::cache(cached);
        }
        self.passthrough(&target, Method::Get).await
    }
}

/// Lets a loader or worker fetch through the cache, the way page code
/// fetches through a service worker.
#[async_trait::async_trait]
impl DataSource for OfflineCache {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = request.url.clone();
        let served = OfflineCache::fetch(self, request)
            .await
            .map_err(|e| FetchError::InvalidUrl {
                url: url.clone(),
                message: e.to_string(),
            })?;
        let CachedResponse {
            status,
            mut headers,
            body,
            ..
        } = served.response;
        headers.insert("content-length".to_string(), body.len().to_string());
        Ok(FetchResponse::from_bytes(url, status, headers, body))
    }

    fn origin(&self) -> &str {
        self.inner.origin.as_str()
    }
}
