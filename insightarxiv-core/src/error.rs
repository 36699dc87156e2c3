//! Error types for the InsightArxiv feed engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering fetching, month loading, the parsing worker, the offline cache,
//! configuration, and the database builder.

use std::path::PathBuf;

/// Top-level error type for the feed engine.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Offline cache error: {0}")]
    Offline(#[from] OfflineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised at the network boundary by a [`DataSource`](crate::source::DataSource).
///
/// `Clone` so a single failed in-flight request can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("Request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Body stream for {url} broke: {message}")]
    Body { url: String, message: String },
}

/// Errors from loading a month bucket.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Loading {month} timed out after {timeout_secs}s")]
    Timeout { month: String, timeout_secs: u64 },

    #[error("Failed to parse {url}: {message}")]
    Parse { url: String, message: String },

    #[error("Invalid month key: {value}")]
    InvalidMonth { value: String },

    #[error("Load task for {month} was aborted")]
    Aborted { month: String },
}

/// Errors from the background parsing worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Network error: HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("Network error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Data format error: Failed to parse JSON. {message}")]
    DataFormat { message: String },

    #[error("Worker job for {month} was cancelled")]
    Cancelled { month: String },

    #[error("Worker job for {month} sent nothing for {silent_ms}ms")]
    Stalled { month: String, silent_ms: u64 },

    #[error("Worker event channel closed")]
    ChannelClosed,
}

/// Errors from the offline cache.
#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    #[error("Cache '{name}' could not be persisted: {message}")]
    Persist { name: String, message: String },

    #[error("Cache directory {path} is unreadable: {message}")]
    Restore { path: PathBuf, message: String },

    #[error("Pre-caching failed for {failed} of {total} assets")]
    Precache { failed: usize, total: usize },

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the database builder.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No input files matched in {dir}")]
    NoInputs { dir: PathBuf },

    #[error("No papers could be processed ({skipped} records skipped)")]
    Empty { skipped: usize },

    #[error("File name {name} does not start with a YYYY-MM-DD date")]
    UndatedFile { name: String },
}

/// A type alias for results using the top-level `FeedError`.
pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_load() {
        let err = FeedError::Load(LoadError::HttpStatus {
            url: "data/2025-07.jsonl".into(),
            status: 404,
        });
        assert_eq!(
            err.to_string(),
            "Load error: HTTP 404 for data/2025-07.jsonl"
        );
    }

    #[test]
    fn test_load_error_transparent_fetch() {
        let err: LoadError = FetchError::Network {
            url: "data/index.json".into(),
            message: "connection refused".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Request to data/index.json failed: connection refused"
        );
    }

    #[test]
    fn test_worker_error_messages_match_protocol() {
        let err = WorkerError::HttpStatus { status: 500 };
        assert_eq!(err.to_string(), "Network error: HTTP status 500");

        let err = WorkerError::DataFormat {
            message: "expected value at line 1 column 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Data format error: Failed to parse JSON. expected value at line 1 column 1"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = FeedError::Config(ConfigError::Invalid {
            message: "window.item_height must be positive".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration: window.item_height must be positive"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FeedError = io_err.into();
        assert!(matches!(err, FeedError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: FeedError = serde_err.into();
        assert!(matches!(err, FeedError::Serialization(_)));
    }

    #[test]
    fn test_load_error_is_clone() {
        let err = LoadError::Timeout {
            month: "2025-07".into(),
            timeout_secs: 60,
        };
        assert_eq!(err.clone(), err);
        assert_eq!(err.to_string(), "Loading 2025-07 timed out after 60s");
    }
}
