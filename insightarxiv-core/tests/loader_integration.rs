//! End-to-end tests: manifest, loader, worker and offline cache feeding the
//! application state, all over the in-memory data source.

use insightarxiv_core::config::{DataConfig, LoaderConfig};
use insightarxiv_core::offline::{CacheStorage, OfflineCache, OfflineConfig};
use insightarxiv_core::source::{DataSource, MemoryRoute, MemorySource};
use insightarxiv_core::worker::{ParseWorker, WorkerConfig, WorkerEvent, WorkerRequest};
use insightarxiv_core::{AppState, LoadOptions, MonthKey, MonthLoader, Paper, PaperFilter};
use insightarxiv_core::{LoadError, fetch_manifest};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn month(s: &str) -> MonthKey {
    MonthKey::parse(s).unwrap()
}

fn paper(id: &str, date: &str, title: &str) -> Paper {
    let mut p = Paper::new(id, title);
    p.date = Some(date.to_string());
    p.categories = vec!["cs.CL".to_string()];
    p
}

fn json_array(papers: &[Paper]) -> String {
    serde_json::to_string(papers).unwrap()
}

fn ndjson(papers: &[Paper]) -> String {
    papers
        .iter()
        .map(|p| serde_json::to_string(p).unwrap() + "\n")
        .collect()
}

fn seeded_source() -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.insert(
        "data/index.json",
        MemoryRoute::ok(
            r#"{"availableMonths":["2025-06","2025-07"],"totalPaperCount":5,"lastUpdated":"2025-07-03"}"#,
        ),
    );
    source.insert(
        "data/2025-07.jsonl",
        MemoryRoute::ok(json_array(&[
            paper("2507.00001", "2025-07-01", "Speculative decoding"),
            paper("2507.00002", "2025-07-02", "Token pruning"),
            paper("2507.00003", "2025-07-03", "Speculative sampling"),
        ])),
    );
    source.insert(
        "data/2025-06.jsonl",
        MemoryRoute::ok(ndjson(&[
            paper("2506.00001", "2025-06-01", "Graph transformers"),
            paper("2506.00002", "2025-06-02", "Speculative graphs"),
        ])),
    );
    source
}

fn loader(source: Arc<dyn DataSource>) -> MonthLoader {
    MonthLoader::new(source, DataConfig::default(), LoaderConfig::default())
}

#[tokio::test]
async fn test_three_record_month_lands_in_state() {
    let source = seeded_source();
    let loader = loader(source.clone());
    let mut state = AppState::default();

    let added = state
        .load_month(&loader, &month("2025-07"), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(added, 3);
    assert_eq!(state.paper_count(), 3);
    for id in ["2507.00001", "2507.00002", "2507.00003"] {
        assert!(state.paper(id).is_some(), "missing {id}");
    }
    assert!(state.is_loaded(&month("2025-07")));
}

#[tokio::test]
async fn test_manifest_preload_and_search() {
    let source = seeded_source();
    let loader = loader(source.clone());
    let manifest = fetch_manifest(source.as_ref(), loader.data_config())
        .await
        .unwrap();
    assert_eq!(manifest.latest(), Some(&month("2025-07")));

    let mut state = AppState::default();
    for (key, result) in loader.preload_recent(&manifest, 2).await {
        let papers = result.unwrap();
        state.apply_load(&key, &papers);
    }
    state.set_manifest(manifest);
    assert_eq!(state.paper_count(), 5);

    let hits: Vec<String> = state
        .ordered_papers(&PaperFilter::query("speculative"))
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(hits, vec!["2507.00003", "2507.00001", "2506.00002"]);

    // Both months now come from the loader cache.
    state.reset();
    state
        .load_month(&loader, &month("2025-06"), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(source.hits("data/2025-06.jsonl"), 1);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_fetch() {
    let source = Arc::new(MemorySource::new().with_latency(Duration::from_millis(20)));
    source.insert(
        "data/2025-07.jsonl",
        MemoryRoute::ok(json_array(&[paper("2507.00001", "2025-07-01", "A")])),
    );
    let loader = loader(source.clone());
    let key = month("2025-07");

    let loads = (0..8).map(|_| loader.load_month(&key, LoadOptions::default()));
    let results = futures::future::join_all(loads).await;

    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert_eq!(source.hits("data/2025-07.jsonl"), 1);
}

#[tokio::test]
async fn test_missing_month_is_an_http_error() {
    let loader = loader(seeded_source());
    let err = loader
        .load_month(&month("2025-01"), LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LoadError::HttpStatus {
            url: "data/2025-01.jsonl".into(),
            status: 404
        }
    );
}

#[tokio::test]
async fn test_worker_batches_fill_state() {
    let source = seeded_source();
    let worker = ParseWorker::new(source, WorkerConfig::default());
    let mut handle = worker.spawn(WorkerRequest::new("data/2025-06.jsonl", month("2025-06")));
    let mut monitor = WorkerConfig::default().monitor();

    let mut state = AppState::default();
    let mut kinds = Vec::new();
    while let Some(event) = handle.next_event(&mut monitor).await.unwrap() {
        state.apply_worker_event(&event);
        kinds.push(event.kind());
        if event.is_terminal() {
            break;
        }
    }
    assert_eq!(
        kinds,
        vec![
            "capabilities",
            "started",
            "fetch_complete",
            "processing_start",
            "batch",
            "complete"
        ]
    );
    assert_eq!(state.paper_count(), 2);
    assert!(state.is_loaded(&month("2025-06")));

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.total_papers, 2);
}

#[tokio::test]
async fn test_worker_error_event_leaves_state_untouched() {
    let source = seeded_source();
    source.insert("data/2025-05.jsonl", MemoryRoute::status(500));
    let worker = ParseWorker::new(source, WorkerConfig::default());
    let mut handle = worker.spawn(WorkerRequest::new("data/2025-05.jsonl", month("2025-05")));

    let mut state = AppState::default();
    let mut last = None;
    while let Some(event) = handle.events.recv().await {
        state.apply_worker_event(&event);
        last = Some(event);
    }
    match last {
        Some(WorkerEvent::Error { error, .. }) => {
            assert_eq!(error, "Network error: HTTP status 500")
        }
        other => panic!("Expected error event, got {other:?}"),
    }
    assert_eq!(state.paper_count(), 0);
    assert!(!state.is_loaded(&month("2025-05")));
}

#[tokio::test]
async fn test_offline_cache_serves_previously_fetched_month() {
    let network = seeded_source();
    let cache = OfflineCache::new(
        OfflineConfig {
            static_assets: Vec::new(),
            ..OfflineConfig::default()
        },
        "http://127.0.0.1:8787/",
        network.clone(),
        Arc::new(CacheStorage::new()),
    )
    .unwrap();
    cache.install().await.unwrap();

    let first = cache
        .fetch(insightarxiv_core::FetchRequest::get("data/2025-07.jsonl"))
        .await
        .unwrap();
    network.set_offline(true);
    let second = cache
        .fetch(insightarxiv_core::FetchRequest::get("data/2025-07.jsonl"))
        .await
        .unwrap();
    assert_eq!(second.response.body, first.response.body);

    // A loader fetching through the cache still gets the month.
    let through_cache = loader(Arc::new(cache));
    let papers = through_cache
        .load_month(&month("2025-07"), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(papers.len(), 3);
}
