//! Messages exchanged between a host and the parsing worker.
//!
//! Outbound events are tagged by `type` with camelCase payload fields, so a
//! serialized event reads the same as the browser worker's `postMessage`
//! payloads.

use serde::{Deserialize, Serialize};

use crate::paper::{MonthKey, Paper};

/// A parse job submitted to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    /// Month file location, resolved by the worker's data source.
    pub url: String,
    pub month: MonthKey,
    #[serde(default)]
    pub config: WorkerJobConfig,
    /// Request image processing; only honored when the host supports it.
    #[serde(default)]
    pub async_image_processing: bool,
}

impl WorkerRequest {
    pub fn new(url: impl Into<String>, month: MonthKey) -> Self {
        Self {
            url: url.into(),
            month,
            config: WorkerJobConfig::default(),
            async_image_processing: false,
        }
    }
}

/// Per-job overrides of the worker defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_time_slicing: Option<bool>,
}

/// Features the worker advertises before its first job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFeatures {
    pub offscreen_canvas: bool,
    pub time_slicing: bool,
    pub async_image_processing: bool,
    pub dynamic_batching: bool,
    pub progress_monitoring: bool,
}

/// Capabilities in effect for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCapabilities {
    pub offscreen_canvas: bool,
    pub async_image_processing: bool,
    pub time_slicing: bool,
}

/// Running progress attached to each batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    /// Papers delivered so far, including this batch.
    pub current: usize,
    pub total: usize,
    /// Share of batches delivered, rounded.
    pub percentage: u8,
    /// 1-based.
    pub batch_index: usize,
    pub total_batches: usize,
    /// Papers per second since the job started.
    pub processing_speed: u64,
    /// Seconds, or -1 while the speed is unknown.
    pub estimated_time_remaining: i64,
    /// Milliseconds spent on this batch.
    pub batch_processing_time: u64,
    pub async_features_used: bool,
}

/// Events emitted by a worker job, in order:
/// `capabilities`, `started`, `fetch_complete`, `processing_start`,
/// `batch`*, then `complete` or `error`. `heartbeat` interleaves anywhere
/// while the job is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Capabilities {
        features: WorkerFeatures,
    },
    #[serde(rename_all = "camelCase")]
    Started {
        month: MonthKey,
        timestamp: i64,
        capabilities: JobCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    FetchComplete {
        month: MonthKey,
        content_length: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    ProcessingStart {
        month: MonthKey,
        total_papers: usize,
        batch_size: usize,
    },
    Batch {
        month: MonthKey,
        papers: Vec<Paper>,
        progress: BatchProgress,
    },
    Heartbeat {
        month: MonthKey,
        timestamp: i64,
        processed: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        month: MonthKey,
        total_papers: usize,
        /// Milliseconds since the job started.
        processing_time: u64,
        timestamp: i64,
        processed_with_async_features: bool,
    },
    Error {
        month: MonthKey,
        error: String,
        timestamp: i64,
    },
}

impl WorkerEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capabilities { .. } => "capabilities",
            Self::Started { .. } => "started",
            Self::FetchComplete { .. } => "fetch_complete",
            Self::ProcessingStart { .. } => "processing_start",
            Self::Batch { .. } => "batch",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn month(&self) -> Option<&MonthKey> {
        match self {
            Self::Capabilities { .. } => None,
            Self::Started { month, .. }
            | Self::FetchComplete { month, .. }
            | Self::ProcessingStart { month, .. }
            | Self::Batch { month, .. }
            | Self::Heartbeat { month, .. }
            | Self::Complete { month, .. }
            | Self::Error { month, .. } => Some(month),
        }
    }

    /// `complete` or `error`: nothing follows on this job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}
