//! Background parsing worker.
//!
//! A [`ParseWorker`] runs each job on its own tokio task. The job fetches a
//! month file, decodes it, cuts it into adaptively sized batches and streams
//! them back to the host as [`WorkerEvent`]s over an unbounded channel. While
//! a job is running a heartbeat reports its progress at a fixed interval.
//!
//! Every job gets a fresh [`JobContext`]; nothing is shared between jobs.

pub mod batch;
pub mod monitor;
pub mod protocol;

pub use batch::{BatchBounds, calculate_batch_size};
pub use monitor::WorkerMonitor;
pub use protocol::{
    BatchProgress, JobCapabilities, WorkerEvent, WorkerFeatures, WorkerJobConfig, WorkerRequest,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::ndjson;
use crate::paper::{MonthKey, Paper};
use crate::source::{DataSource, FetchRequest};

/// Worker defaults; jobs may override the batch bounds and time slicing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub base_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Heartbeat period while a job runs.
    pub heartbeat_interval_ms: u64,
    /// Silence after which [`WorkerMonitor`] declares a job stuck.
    pub stuck_timeout_ms: u64,
    /// Yield to the runtime between batches.
    pub time_slicing: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_batch_size: 1000,
            min_batch_size: 100,
            max_batch_size: 2000,
            heartbeat_interval_ms: 5000,
            stuck_timeout_ms: 15_000,
            time_slicing: true,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }

    pub fn monitor(&self) -> WorkerMonitor {
        WorkerMonitor::new(self.stuck_timeout())
    }
}

/// What a finished job reports to whoever joins it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub month: MonthKey,
    pub total_papers: usize,
    pub batches: usize,
    pub batch_size: usize,
    pub elapsed: Duration,
}

/// Mutable state of one job, visible to its heartbeat task.
#[derive(Debug)]
pub struct JobContext {
    month: MonthKey,
    started_at: Instant,
    processing: AtomicBool,
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl JobContext {
    fn new(month: MonthKey) -> Self {
        Self {
            month,
            started_at: Instant::now(),
            processing: AtomicBool::new(true),
            processed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    pub fn month(&self) -> &MonthKey {
        &self.month
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn finish(&self) {
        self.processing.store(false, Ordering::Release);
    }
}

/// The host's side of a running job.
pub struct WorkerHandle {
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    cancel: CancellationToken,
    context: Arc<JobContext>,
    join: JoinHandle<Result<JobSummary, WorkerError>>,
}

impl WorkerHandle {
    /// Ask the job to stop. Honored until batch processing starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    /// Next event, or `Stalled` if the job stays silent past the monitor's deadline.
    pub async fn next_event(
        &mut self,
        monitor: &mut WorkerMonitor,
    ) -> Result<Option<WorkerEvent>, WorkerError> {
        match tokio::time::timeout_at(monitor.deadline(), self.events.recv()).await {
            Ok(Some(event)) => {
                monitor.observe(&event);
                Ok(Some(event))
            }
            Ok(None) => Ok(None),
            Err(_) => Err(WorkerError::Stalled {
                month: self.context.month.to_string(),
                silent_ms: monitor.silent_for().as_millis() as u64,
            }),
        }
    }

    /// Wait for the job task to end.
    pub async fn join(self) -> Result<JobSummary, WorkerError> {
        match self.join.await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::ChannelClosed),
        }
    }
}

/// Spawns parse jobs against a [`DataSource`].
#[derive(Clone)]
pub struct ParseWorker {
    source: Arc<dyn DataSource>,
    config: WorkerConfig,
}

impl ParseWorker {
    pub fn new(source: Arc<dyn DataSource>, config: WorkerConfig) -> Self {
        Self { source, config }
    }

    /// Features of this worker. Native hosts have no offscreen canvas.
    pub fn features(&self) -> WorkerFeatures {
        WorkerFeatures {
            offscreen_canvas: false,
            time_slicing: self.config.time_slicing,
            async_image_processing: false,
            dynamic_batching: true,
            progress_monitoring: true,
        }
    }

    /// Start a job; its events arrive on the returned handle.
    pub fn spawn(&self, request: WorkerRequest) -> WorkerHandle {
        let (events, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let context = Arc::new(JobContext::new(request.month.clone()));
        let job = Job {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            features: self.features(),
            request,
            context: Arc::clone(&context),
            events,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(job.run());
        WorkerHandle {
            events: receiver,
            cancel,
            context,
            join,
        }
    }
}

struct Job {
    source: Arc<dyn DataSource>,
    config: WorkerConfig,
    features: WorkerFeatures,
    request: WorkerRequest,
    context: Arc<JobContext>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Job {
    async fn run(self) -> Result<JobSummary, WorkerError> {
        let month = self.request.month.clone();
        let heartbeat_stop = CancellationToken::new();
        tokio::spawn(heartbeat(
            Arc::clone(&self.context),
            self.events.clone(),
            self.config.heartbeat_interval(),
            heartbeat_stop.clone(),
        ));
        let _stop_heartbeat = heartbeat_stop.drop_guard();

        let result = self.process().await;
        self.context.finish();

        match result {
            Ok(summary) => {
                info!(
                    month = %month,
                    papers = summary.total_papers,
                    batches = summary.batches,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "Worker job complete"
                );
                Ok(summary)
            }
            Err(WorkerError::Cancelled { month }) => {
                info!(month = %month, "Worker job cancelled");
                Err(WorkerError::Cancelled { month })
            }
            Err(WorkerError::ChannelClosed) => {
                debug!(month = %month, "Host stopped listening");
                Err(WorkerError::ChannelClosed)
            }
            Err(e) => {
                warn!(month = %month, error = %e, "Worker job failed");
                // The host may already be gone; the job ends either way.
                let _ = self.events.send(WorkerEvent::Error {
                    month,
                    error: e.to_string(),
                    timestamp: now_millis(),
                });
                Err(e)
            }
        }
    }

    fn emit(&self, event: WorkerEvent) -> Result<(), WorkerError> {
        self.events
            .send(event)
            .map_err(|_| WorkerError::ChannelClosed)
    }

    fn cancelled(&self) -> WorkerError {
        WorkerError::Cancelled {
            month: self.request.month.to_string(),
        }
    }

    async fn process(&self) -> Result<JobSummary, WorkerError> {
        let month = self.request.month.clone();
        let time_slicing = self
            .request
            .config
            .enable_time_slicing
            .unwrap_or(self.config.time_slicing);
        // No offscreen canvas natively, so image processing never activates.
        let async_images = self.request.async_image_processing && self.features.offscreen_canvas;

        self.emit(WorkerEvent::Capabilities {
            features: self.features,
        })?;
        self.emit(WorkerEvent::Started {
            month: month.clone(),
            timestamp: now_millis(),
            capabilities: JobCapabilities {
                offscreen_canvas: self.features.offscreen_canvas,
                async_image_processing: async_images,
                time_slicing,
            },
        })?;

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
            response = self.source.fetch(FetchRequest::get(&self.request.url)) => response?,
        };
        if !response.is_success() {
            return Err(WorkerError::HttpStatus {
                status: response.status,
            });
        }
        self.emit(WorkerEvent::FetchComplete {
            month: month.clone(),
            content_length: response.content_length(),
        })?;

        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
            body = response.bytes() => body?,
        };
        let decoded = ndjson::decode_all::<Paper>(&body).map_err(|e| WorkerError::DataFormat {
            message: e.to_string(),
        })?;
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }

        let papers = decoded.records;
        let total = papers.len();
        self.context.total.store(total, Ordering::Release);
        let bounds = BatchBounds::resolve(&self.request.config, &self.config);
        let batch_size = calculate_batch_size(total, bounds, async_images);
        self.emit(WorkerEvent::ProcessingStart {
            month: month.clone(),
            total_papers: total,
            batch_size,
        })?;

        let total_batches = total.div_ceil(batch_size);
        let mut remaining = papers.into_iter();
        for batch_index in 1..=total_batches {
            let batch_started = Instant::now();
            let batch: Vec<Paper> = remaining.by_ref().take(batch_size).collect();
            let processed = self.context.processed.fetch_add(batch.len(), Ordering::AcqRel)
                + batch.len();

            let elapsed = self.context.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            };
            let eta = if speed > 0.0 {
                ((total - processed) as f64 / speed).round() as i64
            } else {
                -1
            };
            let progress = BatchProgress {
                current: processed,
                total,
                percentage: ((batch_index * 100) as f64 / total_batches as f64).round() as u8,
                batch_index,
                total_batches,
                processing_speed: speed.round() as u64,
                estimated_time_remaining: eta,
                batch_processing_time: batch_started.elapsed().as_millis() as u64,
                async_features_used: async_images,
            };
            self.emit(WorkerEvent::Batch {
                month: month.clone(),
                papers: batch,
                progress,
            })?;

            if time_slicing {
                tokio::task::yield_now().await;
            }
        }

        let elapsed = self.context.elapsed();
        self.emit(WorkerEvent::Complete {
            month: month.clone(),
            total_papers: total,
            processing_time: elapsed.as_millis() as u64,
            timestamp: now_millis(),
            processed_with_async_features: async_images,
        })?;

        Ok(JobSummary {
            month,
            total_papers: total,
            batches: total_batches,
            batch_size,
            elapsed,
        })
    }
}

async fn heartbeat(
    context: Arc<JobContext>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if !context.is_processing() {
                    break;
                }
                let beat = WorkerEvent::Heartbeat {
                    month: context.month.clone(),
                    timestamp: now_millis(),
                    processed: context.processed(),
                    total: context.total(),
                };
                if events.send(beat).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryRoute, MemorySource};

    fn month() -> MonthKey {
        MonthKey::parse("2025-07").unwrap()
    }

    fn papers_json(count: usize) -> String {
        let items: Vec<String> = (0..count)
            .map(|i| format!(r#"{{"id":"2507.{i:05}","title":"Paper {i}"}}"#))
            .collect();
        format!("[{}]", items.join(","))
    }

    fn worker_with(source: MemorySource) -> ParseWorker {
        ParseWorker::new(Arc::new(source), WorkerConfig::default())
    }

    async fn collect(handle: &mut WorkerHandle) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[WorkerEvent]) -> Vec<&'static str> {
        events.iter().map(WorkerEvent::kind).collect()
    }

    #[tokio::test]
    async fn test_job_event_sequence() {
        let source = MemorySource::new();
        source.insert("data/2025-07.json", MemoryRoute::ok(papers_json(250)));
        let worker = worker_with(source);

        let mut handle = worker.spawn(WorkerRequest::new("data/2025-07.json", month()));
        let events = collect(&mut handle).await;
        assert_eq!(
            kinds(&events),
            vec![
                "capabilities",
                "started",
                "fetch_complete",
                "processing_start",
                "batch",
                "batch",
                "batch",
                "complete"
            ]
        );

        let WorkerEvent::ProcessingStart { batch_size, total_papers, .. } = &events[3] else {
            panic!("expected processing_start");
        };
        assert_eq!((*total_papers, *batch_size), (250, 100));

        let WorkerEvent::Batch { papers, progress, .. } = &events[6] else {
            panic!("expected batch");
        };
        assert_eq!(papers.len(), 50);
        assert_eq!(progress.current, 250);
        assert_eq!(progress.batch_index, 3);
        assert_eq!(progress.total_batches, 3);
        assert_eq!(progress.percentage, 100);

        let summary = handle.join().await.unwrap();
        assert_eq!(summary.total_papers, 250);
        assert_eq!(summary.batches, 3);
    }

    #[tokio::test]
    async fn test_http_error_message() {
        let source = MemorySource::new();
        source.insert("data/2025-07.json", MemoryRoute::status(500));
        let worker = worker_with(source);

        let mut handle = worker.spawn(WorkerRequest::new("data/2025-07.json", month()));
        let events = collect(&mut handle).await;
        let Some(WorkerEvent::Error { error, .. }) = events.last() else {
            panic!("expected error event");
        };
        assert_eq!(error, "Network error: HTTP status 500");
        assert!(matches!(
            handle.join().await,
            Err(WorkerError::HttpStatus { status: 500 })
        ));
    }

    #[tokio::test]
    async fn test_malformed_json_is_data_format_error() {
        let source = MemorySource::new();
        source.insert("data/2025-07.json", MemoryRoute::ok("[{\"id\": 1"));
        let worker = worker_with(source);

        let mut handle = worker.spawn(WorkerRequest::new("data/2025-07.json", month()));
        let events = collect(&mut handle).await;
        assert_eq!(kinds(&events).last(), Some(&"error"));
        let WorkerEvent::Error { error, .. } = events.last().unwrap() else {
            unreachable!()
        };
        assert!(error.starts_with("Data format error: Failed to parse JSON."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_during_slow_fetch() {
        let source = MemorySource::new().with_latency(Duration::from_secs(12));
        source.insert("data/2025-07.json", MemoryRoute::ok(papers_json(3)));
        let worker = worker_with(source);

        let mut handle = worker.spawn(WorkerRequest::new("data/2025-07.json", month()));
        let events = collect(&mut handle).await;
        let kinds = kinds(&events);
        assert_eq!(&kinds[..4], &["capabilities", "started", "heartbeat", "heartbeat"]);
        assert_eq!(kinds.iter().filter(|k| **k == "heartbeat").count(), 2);
        assert_eq!(kinds.last(), Some(&"complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_processing() {
        let source = MemorySource::new().with_latency(Duration::from_secs(3));
        source.insert("data/2025-07.json", MemoryRoute::ok(papers_json(3)));
        let worker = worker_with(source);

        let mut handle = worker.spawn(WorkerRequest::new("data/2025-07.json", month()));
        handle.cancel();
        let events = collect(&mut handle).await;
        assert!(!kinds(&events).contains(&"processing_start"));
        assert!(!kinds(&events).contains(&"error"));
        assert!(matches!(
            handle.join().await,
            Err(WorkerError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_jobs_do_not_share_state() {
        let source = MemorySource::new();
        source.insert("a.json", MemoryRoute::ok(papers_json(120)));
        source.insert("b.json", MemoryRoute::ok(papers_json(30)));
        let worker = worker_with(source);

        let a = worker.spawn(WorkerRequest::new("a.json", month()));
        let b = worker.spawn(WorkerRequest::new("b.json", month()));
        let (a, b) = (a.join().await.unwrap(), b.join().await.unwrap());
        assert_eq!(a.total_papers, 120);
        assert_eq!(b.total_papers, 30);
    }

    #[tokio::test]
    async fn test_ndjson_file_and_time_slicing_off() {
        let body = (0..5)
            .map(|i| format!(r#"{{"id":"2507.{i:05}"}}"#))
            .collect::<Vec<_>>()
            .join("\n");
        let source = MemorySource::new();
        source.insert("data/2025-07.jsonl", MemoryRoute::ok(body));
        let worker = worker_with(source);

        let mut request = WorkerRequest::new("data/2025-07.jsonl", month());
        request.config.enable_time_slicing = Some(false);
        request.async_image_processing = true;
        let mut handle = worker.spawn(request);
        let events = collect(&mut handle).await;

        let WorkerEvent::Started { capabilities, .. } = &events[1] else {
            panic!("expected started");
        };
        assert!(!capabilities.time_slicing);
        assert!(!capabilities.async_image_processing);
        assert_eq!(kinds(&events).last(), Some(&"complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_event_reports_stall() {
        let source = MemorySource::new().with_latency(Duration::from_secs(60));
        source.insert("a.json", MemoryRoute::ok(papers_json(1)));
        let config = WorkerConfig {
            heartbeat_interval_ms: 3_600_000,
            stuck_timeout_ms: 1000,
            ..WorkerConfig::default()
        };
        let worker = ParseWorker::new(Arc::new(source), config.clone());
        let mut handle = worker.spawn(WorkerRequest::new("a.json", month()));
        let mut monitor = config.monitor();

        assert_eq!(
            handle.next_event(&mut monitor).await.unwrap().unwrap().kind(),
            "capabilities"
        );
        assert_eq!(
            handle.next_event(&mut monitor).await.unwrap().unwrap().kind(),
            "started"
        );
        let err = handle.next_event(&mut monitor).await.unwrap_err();
        assert!(matches!(err, WorkerError::Stalled { .. }));
    }
}
