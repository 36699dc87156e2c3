//! # InsightArxiv Core
//!
//! Feed engine for a monthly arXiv paper feed with AI-generated Chinese
//! summaries. Provides the month catalog, an incremental month loader with
//! in-flight deduplication, a background parsing worker, windowed rendering
//! math, search and filtering, an offline cache with an HTTP proxy, and the
//! database builder that produces the month files.

pub mod builder;
pub mod config;
pub mod error;
pub mod loader;
pub mod lru_cache;
pub mod manifest;
pub mod ndjson;
pub mod offline;
pub mod paper;
pub mod persistence;
pub mod search;
pub mod source;
pub mod state;
pub mod window;
pub mod worker;

// Re-export commonly used types at the crate root.
pub use builder::{Database, DatabaseBuilder};
pub use config::{CacheConfig, DataConfig, FeedConfig, LoaderConfig};
pub use error::{
    BuildError, ConfigError, FeedError, FetchError, LoadError, OfflineError, Result, WorkerError,
};
pub use loader::{LoadOptions, LoadProgress, MonthLoader, Papers};
pub use lru_cache::BoundedCache;
pub use manifest::{Manifest, fetch_manifest};
pub use offline::{CacheStorage, ControlMessage, ControlReply, OfflineCache, OfflineConfig};
pub use paper::{MonthKey, Paper};
pub use search::SearchIndex;
pub use source::{DataSource, FetchRequest, FetchResponse, HttpSource, MemoryRoute, MemorySource};
pub use state::{AppState, PaperFilter};
pub use window::{NodeRenderer, PaperDetail, VirtualList, WindowConfig, visible_range};
pub use worker::{ParseWorker, WorkerConfig, WorkerEvent, WorkerHandle, WorkerRequest};
