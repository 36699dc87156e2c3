//! Application state owned by the host.
//!
//! [`AppState`] holds every loaded paper keyed by id, the month buckets they
//! belong to, the search index, and the LRU caches in front of search and
//! detail rendering. It is created per session and reset explicitly.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::LoadError;
use crate::loader::{LoadOptions, MonthLoader};
use crate::lru_cache::{BoundedCache, CacheStats};
use crate::manifest::Manifest;
use crate::paper::{MonthKey, Paper};
use crate::search::SearchIndex;
use crate::window::PaperDetail;
use crate::worker::WorkerEvent;

/// Restricts [`AppState::ordered_papers`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaperFilter {
    /// Every token must match.
    pub query: Option<String>,
    /// Any-of.
    pub categories: Vec<String>,
    /// Exact `YYYY-MM-DD` listing date.
    pub date: Option<String>,
    pub month: Option<MonthKey>,
}

impl PaperFilter {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn with_month(mut self, month: MonthKey) -> Self {
        self.month = Some(month);
        self
    }

    fn active_query(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    fn matches(&self, paper: &Paper) -> bool {
        if !self.categories.is_empty()
            && !paper.categories.iter().any(|c| self.categories.contains(c))
        {
            return false;
        }
        if let Some(date) = &self.date {
            if paper.date.as_deref() != Some(date.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Counters for the status line.
#[derive(Debug, Clone, Serialize)]
pub struct StateStats {
    pub papers: usize,
    pub loaded_months: usize,
    pub indexed_terms: usize,
    pub search_cache: CacheStats,
    pub detail_cache: CacheStats,
}

/// Everything the host knows about the feed.
#[derive(Debug)]
pub struct AppState {
    manifest: Option<Manifest>,
    all_papers: HashMap<String, Paper>,
    /// Month each paper was filed under.
    paper_month: HashMap<String, MonthKey>,
    buckets: BTreeMap<MonthKey, BTreeSet<String>>,
    loaded_months: BTreeSet<MonthKey>,
    search_index: SearchIndex,
    search_cache: BoundedCache<String, Arc<Vec<String>>>,
    detail_cache: BoundedCache<String, Arc<PaperDetail>>,
    cache_config: CacheConfig,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl AppState {
    pub fn new(cache_config: CacheConfig) -> Self {
        Self {
            manifest: None,
            all_papers: HashMap::new(),
            paper_month: HashMap::new(),
            buckets: BTreeMap::new(),
            loaded_months: BTreeSet::new(),
            search_index: SearchIndex::new(),
            search_cache: BoundedCache::new(cache_config.search_capacity),
            detail_cache: BoundedCache::new(cache_config.detail_capacity),
            cache_config,
        }
    }

    pub fn set_manifest(&mut self, manifest: Manifest) {
        self.manifest = Some(manifest);
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn paper(&self, id: &str) -> Option<&Paper> {
        self.all_papers.get(id)
    }

    pub fn paper_count(&self) -> usize {
        self.all_papers.len()
    }

    pub fn is_loaded(&self, month: &MonthKey) -> bool {
        self.loaded_months.contains(month)
    }

    pub fn loaded_months(&self) -> impl Iterator<Item = &MonthKey> {
        self.loaded_months.iter()
    }

    /// Ids filed under `month`.
    pub fn bucket(&self, month: &MonthKey) -> Option<&BTreeSet<String>> {
        self.buckets.get(month)
    }

    /// Store the result of a month load and mark the month loaded.
    /// Returns the number of papers inserted or replaced.
    pub fn apply_load(&mut self, month: &MonthKey, papers: &[Paper]) -> usize {
        self.insert_papers(month, papers);
        self.loaded_months.insert(month.clone());
        info!(month = %month, papers = papers.len(), total = self.all_papers.len(), "Month applied");
        papers.len()
    }

    /// Fold a worker event into the state. Returns whether anything changed.
    pub fn apply_worker_event(&mut self, event: &WorkerEvent) -> bool {
        match event {
            WorkerEvent::Batch { month, papers, .. } => {
                self.insert_papers(month, papers);
                !papers.is_empty()
            }
            WorkerEvent::Complete { month, .. } => self.loaded_months.insert(month.clone()),
            _ => false,
        }
    }

    /// Drop every paper filed under `month`. Returns how many were removed.
    pub fn unload_month(&mut self, month: &MonthKey) -> usize {
        self.loaded_months.remove(month);
        let Some(ids) = self.buckets.remove(month) else {
            return 0;
        };
        for id in &ids {
            self.paper_month.remove(id);
            if let Some(paper) = self.all_papers.remove(id) {
                self.search_index.remove(&paper);
            }
            self.detail_cache.remove(id.as_str());
        }
        self.search_cache.clear();
        debug!(month = %month, removed = ids.len(), "Month unloaded");
        ids.len()
    }

    /// Forget everything, keeping the cache capacities.
    pub fn reset(&mut self) {
        *self = Self::new(self.cache_config.clone());
    }

    /// Load `month` through `loader` and apply the result.
    pub async fn load_month(
        &mut self,
        loader: &MonthLoader,
        month: &MonthKey,
        options: LoadOptions,
    ) -> Result<usize, LoadError> {
        let papers = loader.load_month(month, options).await?;
        Ok(self.apply_load(month, &papers))
    }

    /// Ids of papers matching every token of `query`, sorted by id.
    pub fn search(&mut self, query: &str) -> Arc<Vec<String>> {
        let key = query.trim().to_lowercase();
        if key.is_empty() {
            return Arc::new(Vec::new());
        }
        if let Some(hit) = self.search_cache.get_cloned(key.as_str()) {
            debug!(query = %key, "Search cache hit");
            return hit;
        }
        let ids = Arc::new(self.search_index.search(&key));
        self.search_cache.put(key, Arc::clone(&ids));
        ids
    }

    /// Expanded-card content for `id`.
    pub fn detail(&mut self, id: &str) -> Option<Arc<PaperDetail>> {
        if let Some(hit) = self.detail_cache.get_cloned(id) {
            return Some(hit);
        }
        let detail = Arc::new(PaperDetail::of(self.all_papers.get(id)?));
        self.detail_cache.put(id.to_string(), Arc::clone(&detail));
        Some(detail)
    }

    /// Papers passing `filter`, newest first (date desc, then id desc).
    pub fn ordered_papers(&mut self, filter: &PaperFilter) -> Vec<Paper> {
        let query_hits = filter.active_query().map(|q| self.search(q));

        let mut papers: Vec<&Paper> = match &query_hits {
            Some(ids) => ids.iter().filter_map(|id| self.all_papers.get(id)).collect(),
            None => self.all_papers.values().collect(),
        };
        papers.retain(|paper| {
            filter.matches(paper)
                && filter
                    .month
                    .as_ref()
                    .is_none_or(|m| self.paper_month.get(&paper.id) == Some(m))
        });
        papers.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
        papers.into_iter().cloned().collect()
    }

    /// Paper count per category, for filter menus.
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for paper in self.all_papers.values() {
            for category in &paper.categories {
                *counts.entry(category.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            papers: self.all_papers.len(),
            loaded_months: self.loaded_months.len(),
            indexed_terms: self.search_index.term_count(),
            search_cache: self.search_cache.stats(),
            detail_cache: self.detail_cache.stats(),
        }
    }

    fn insert_papers(&mut self, fallback: &MonthKey, papers: &[Paper]) {
        if papers.is_empty() {
            return;
        }
        for paper in papers {
            let month = paper.month_key_or_date().unwrap_or_else(|| fallback.clone());
            if let Some(previous) = self.all_papers.remove(&paper.id) {
                self.search_index.remove(&previous);
            }
            if let Some(old_month) = self.paper_month.insert(paper.id.clone(), month.clone()) {
                if old_month != month {
                    if let Some(ids) = self.buckets.get_mut(&old_month) {
                        ids.remove(&paper.id);
                    }
                }
            }
            self.buckets
                .entry(month)
                .or_default()
                .insert(paper.id.clone());
            self.search_index.insert(paper);
            self.detail_cache.remove(paper.id.as_str());
            self.all_papers.insert(paper.id.clone(), paper.clone());
        }
        self.search_cache.clear();
    }
}
