//! Incremental month loader.
//!
//! [`MonthLoader::load_month`] fetches one month file, either whole or
//! streamed line by line, and caches the decoded papers. Concurrent callers
//! asking for the same month while a fetch is pending share that fetch: the
//! load runs in its own task and every caller awaits the same
//! [`Shared`] handle.

use bytes::BytesMut;
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DataConfig, LoaderConfig};
use crate::error::LoadError;
use crate::manifest::Manifest;
use crate::ndjson::{self, StreamDecoder};
use crate::paper::{MonthKey, Paper};
use crate::source::{DataSource, FetchRequest};

/// Decoded papers of one month, shared between the cache and callers.
pub type Papers = Arc<Vec<Paper>>;

type SharedLoad = Shared<BoxFuture<'static, Result<Papers, LoadError>>>;

/// Scheduling hint attached to a load; only reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for LoadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Stage a load is in when it reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    Downloading,
    Parsing,
    Streaming,
}

/// A progress report. `loaded` counts bytes while downloading and records
/// while streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub loaded: u64,
    pub total: Option<u64>,
    pub phase: LoadPhase,
    pub percentage: Option<u8>,
}

/// Per-call load options.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Serve a completed month from the cache.
    pub use_cache: bool,
    pub priority: LoadPriority,
    /// Allow line streaming when the network is slow.
    pub chunked: bool,
    /// Receives progress reports of the fetch this call starts.
    pub progress: Option<mpsc::UnboundedSender<LoadProgress>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            priority: LoadPriority::Normal,
            chunked: false,
            progress: None,
        }
    }
}

impl LoadOptions {
    pub fn bypass_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_priority(mut self, priority: LoadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    pub fn with_progress(mut self, sink: mpsc::UnboundedSender<LoadProgress>) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// Snapshot of loader state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoaderStats {
    pub cached_months: usize,
    pub cached_papers: usize,
    pub active_loads: usize,
    /// Last measured throughput in bytes per second.
    pub network_speed: Option<u64>,
}

struct CacheEntry {
    papers: Papers,
    stored_at: Instant,
}

struct LoaderInner {
    source: Arc<dyn DataSource>,
    data: DataConfig,
    config: LoaderConfig,
    cache: Mutex<HashMap<MonthKey, CacheEntry>>,
    in_flight: Mutex<HashMap<MonthKey, SharedLoad>>,
    /// Bytes per second, 0 while unmeasured.
    network_speed: AtomicU64,
}

/// Loads month files with at most one fetch in flight per month.
///
/// Cloning is cheap; clones share the cache and the in-flight table.
#[derive(Clone)]
pub struct MonthLoader {
    inner: Arc<LoaderInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MonthLoader {
    pub fn new(source: Arc<dyn DataSource>, data: DataConfig, config: LoaderConfig) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                source,
                data,
                config,
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                network_speed: AtomicU64::new(0),
            }),
        }
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.inner.source
    }

    pub fn data_config(&self) -> &DataConfig {
        &self.inner.data
    }

    /// Load `month`, joining a pending fetch for it if there is one.
    pub async fn load_month(
        &self,
        month: &MonthKey,
        options: LoadOptions,
    ) -> Result<Papers, LoadError> {
        let shared = {
            let mut in_flight = lock(&self.inner.in_flight);
            if options.use_cache {
                if let Some(entry) = lock(&self.inner.cache).get(month) {
                    debug!(month = %month, "Serving month from cache");
                    return Ok(Arc::clone(&entry.papers));
                }
            }
            match in_flight.get(month) {
                Some(pending) => {
                    debug!(month = %month, "Joining in-flight load");
                    pending.clone()
                }
                None => {
                    let pending = self.spawn_load(month.clone(), options);
                    in_flight.insert(month.clone(), pending.clone());
                    pending
                }
            }
        };
        shared.await
    }

    fn spawn_load(&self, month: MonthKey, options: LoadOptions) -> SharedLoad {
        let inner = Arc::clone(&self.inner);
        let key = month.clone();
        let handle = tokio::spawn(async move {
            let result = inner.perform_load(&key, &options).await.map(Arc::new);
            if let Ok(papers) = &result {
                lock(&inner.cache).insert(
                    key.clone(),
                    CacheEntry {
                        papers: Arc::clone(papers),
                        stored_at: Instant::now(),
                    },
                );
            }
            lock(&inner.in_flight).remove(&key);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(month = %month, error = %e, "Load task ended abnormally");
                    Err(LoadError::Aborted {
                        month: month.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Papers of `month` if it is cached.
    pub fn cached(&self, month: &MonthKey) -> Option<Papers> {
        lock(&self.inner.cache)
            .get(month)
            .map(|entry| Arc::clone(&entry.papers))
    }

    pub fn is_cached(&self, month: &MonthKey) -> bool {
        lock(&self.inner.cache).contains_key(month)
    }

    pub fn is_loading(&self, month: &MonthKey) -> bool {
        lock(&self.inner.in_flight).contains_key(month)
    }

    /// Override the measured throughput (bytes per second).
    pub fn set_network_speed(&self, bytes_per_sec: u64) {
        self.inner
            .network_speed
            .store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn network_speed(&self) -> Option<u64> {
        self.inner.network_speed()
    }

    /// Drop cached months stored more than `max_age` ago. Returns how many were removed.
    pub fn cleanup_cache(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut cache = lock(&self.inner.cache);
        let before = cache.len();
        cache.retain(|_, entry| now.duration_since(entry.stored_at) <= max_age);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Expired cached months");
        }
        removed
    }

    /// [`cleanup_cache`](Self::cleanup_cache) with the configured age.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_cache(self.inner.config.cache_max_age())
    }

    /// Load the `count` newest months concurrently at low priority.
    ///
    /// Individual failures are logged and returned, never propagated.
    pub async fn preload_recent(
        &self,
        manifest: &Manifest,
        count: usize,
    ) -> Vec<(MonthKey, Result<Papers, LoadError>)> {
        let months = manifest.recent(count).to_vec();
        let loads = months.iter().map(|month| {
            self.load_month(
                month,
                LoadOptions::default().with_priority(LoadPriority::Low),
            )
        });
        let results = join_all(loads).await;

        let outcome: Vec<_> = months.into_iter().zip(results).collect();
        for (month, result) in &outcome {
            if let Err(e) = result {
                warn!(month = %month, error = %e, "Preload failed");
            }
        }
        info!(
            requested = outcome.len(),
            loaded = outcome.iter().filter(|(_, r)| r.is_ok()).count(),
            "Preloaded recent months"
        );
        outcome
    }

    pub fn stats(&self) -> LoaderStats {
        // One lock at a time; `load_month` nests `cache` inside `in_flight`.
        let (cached_months, cached_papers) = {
            let cache = lock(&self.inner.cache);
            (cache.len(), cache.values().map(|e| e.papers.len()).sum())
        };
        let active_loads = lock(&self.inner.in_flight).len();
        LoaderStats {
            cached_months,
            cached_papers,
            active_loads,
            network_speed: self.network_speed(),
        }
    }

    /// Forget every cached month. Pending loads still complete and cache.
    pub fn clear(&self) {
        lock(&self.inner.cache).clear();
    }
}

impl LoaderInner {
    fn network_speed(&self) -> Option<u64> {
        match self.network_speed.load(Ordering::Relaxed) {
            0 => None,
            speed => Some(speed),
        }
    }

    // Content encoding is negotiated and decoded by the source.
    fn request(&self, url: &str) -> FetchRequest {
        FetchRequest::get(url).with_header("Accept", "application/json,text/plain")
    }

    async fn perform_load(
        &self,
        month: &MonthKey,
        options: &LoadOptions,
    ) -> Result<Vec<Paper>, LoadError> {
        let url = self.data.month_path(month);
        let streamed = options.chunked
            && self
                .network_speed()
                .is_some_and(|speed| speed < self.config.chunked_threshold_bytes_per_sec);
        info!(
            month = %month,
            priority = %options.priority,
            streamed,
            "Loading month"
        );

        let work = async {
            if streamed {
                self.load_streamed(&url, options).await
            } else {
                self.load_whole(&url, options).await
            }
        };
        match tokio::time::timeout(self.config.timeout(), work).await {
            Ok(Ok(papers)) => Ok(papers),
            Ok(Err(e)) => {
                tracing::error!(month = %month, error = %e, "Month load failed");
                Err(e)
            }
            Err(_) => {
                tracing::error!(month = %month, "Month load timed out");
                Err(LoadError::Timeout {
                    month: month.to_string(),
                    timeout_secs: self.config.timeout_secs,
                })
            }
        }
    }

    async fn load_whole(&self, url: &str, options: &LoadOptions) -> Result<Vec<Paper>, LoadError> {
        let started = Instant::now();
        let response = self.source.fetch(self.request(url)).await?;
        if !response.is_success() {
            return Err(LoadError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let total = response.content_length().filter(|&t| t > 0);
        let mut body = response.body;
        report(options, 0, total, LoadPhase::Downloading);

        let mut buffer = BytesMut::new();
        let mut loaded = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            loaded += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            report(options, loaded, total, LoadPhase::Downloading);
        }
        report(options, loaded, total.or(Some(loaded)), LoadPhase::Parsing);

        let decoded = ndjson::decode_all::<Paper>(&buffer).map_err(|e| LoadError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let elapsed = started.elapsed();
        if loaded > 0 && !elapsed.is_zero() {
            let speed = (loaded as f64 / elapsed.as_secs_f64()) as u64;
            self.network_speed.store(speed.max(1), Ordering::Relaxed);
        }
        info!(
            url,
            papers = decoded.records.len(),
            skipped = decoded.skipped,
            bytes = loaded,
            elapsed_ms = elapsed.as_millis() as u64,
            "Loaded month file"
        );
        Ok(decoded.records)
    }

    async fn load_streamed(
        &self,
        url: &str,
        options: &LoadOptions,
    ) -> Result<Vec<Paper>, LoadError> {
        let response = self.source.fetch(self.request(url)).await?;
        if !response.is_success() {
            return Err(LoadError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let every = self.config.progress_every.max(1);
        let mut body = response.body;
        let mut decoder: StreamDecoder<Paper> = StreamDecoder::new();
        let mut papers = Vec::new();
        while let Some(chunk) = body.next().await {
            for paper in decoder.push(&chunk?) {
                papers.push(paper);
                if papers.len() % every == 0 {
                    report(options, papers.len() as u64, None, LoadPhase::Streaming);
                    tokio::task::yield_now().await;
                }
            }
        }

        let tail = decoder.finish().map_err(|e| LoadError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        papers.extend(tail.records);
        info!(
            url,
            papers = papers.len(),
            skipped = tail.skipped,
            "Streamed month file"
        );
        Ok(papers)
    }
}

fn report(options: &LoadOptions, loaded: u64, total: Option<u64>, phase: LoadPhase) {
    if let Some(sink) = &options.progress {
        let percentage = total.map(|t| ((loaded.saturating_mul(100)) / t.max(1)).min(100) as u8);
        // A dropped receiver only means nobody is watching.
        let _ = sink.send(LoadProgress {
            loaded,
            total,
            phase,
            percentage,
        });
    }
}
