//! Configuration system for InsightArxiv.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/insightarxiv/config.toml` and/or
//! `.insightarxiv/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::offline::OfflineConfig;
use crate::paper::MonthKey;
use crate::window::WindowConfig;
use crate::worker::WorkerConfig;

/// Placeholder substituted with the `YYYY-MM` month key in path templates.
pub const MONTH_PLACEHOLDER: &str = "{month}";

/// Top-level configuration for the feed engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
}

impl FeedConfig {
    /// Reject values that would break an invariant downstream.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if !self.data.month_path_template.contains(MONTH_PLACEHOLDER) {
            return invalid("data.month_path_template must contain {month}");
        }
        if !(self.window.item_height.is_finite() && self.window.item_height > 0.0) {
            return invalid("window.item_height must be positive");
        }
        if self.worker.min_batch_size == 0 {
            return invalid("worker.min_batch_size must be at least 1");
        }
        if self.worker.min_batch_size > self.worker.max_batch_size {
            return invalid("worker.min_batch_size exceeds worker.max_batch_size");
        }
        if self.worker.heartbeat_interval_ms == 0 {
            return invalid("worker.heartbeat_interval_ms must be positive");
        }
        if self.cache.search_capacity == 0 || self.cache.detail_capacity == 0 {
            return invalid("cache capacities must be at least 1");
        }
        if self.loader.timeout_secs == 0 {
            return invalid("loader.timeout_secs must be positive");
        }
        Ok(())
    }
}

/// Where month files and the manifest live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Base URL every relative data path is resolved against.
    pub base_url: String,
    /// Path of a month file; `{month}` is replaced by the `YYYY-MM` key.
    pub month_path_template: String,
    /// Path of the manifest listing available months.
    pub manifest_path: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/".to_string(),
            month_path_template: "data/{month}.jsonl".to_string(),
            manifest_path: "data/index.json".to_string(),
        }
    }
}

impl DataConfig {
    /// Relative path of the data file for `month`.
    pub fn month_path(&self, month: &MonthKey) -> String {
        self.month_path_template
            .replace(MONTH_PLACEHOLDER, month.as_str())
    }
}

/// Tuning for the incremental month loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Upper bound on fetch plus body read for one month.
    pub timeout_secs: u64,
    /// Below this measured throughput, chunked loads stream line by line.
    pub chunked_threshold_bytes_per_sec: u64,
    /// Completed months older than this are dropped by `cleanup_cache`.
    pub cache_max_age_secs: u64,
    /// Streamed loads report progress (and yield) every this many records.
    pub progress_every: usize,
    /// Number of newest months `preload_recent` fetches by default.
    pub preload_count: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            chunked_threshold_bytes_per_sec: 1024 * 1024,
            cache_max_age_secs: 10 * 60,
            progress_every: 10,
            preload_count: 3,
        }
    }
}

impl LoaderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }
}

/// Capacities of the LRU caches held by the application state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cached search queries.
    pub search_capacity: usize,
    /// Cached expanded paper details.
    pub detail_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            search_capacity: 20,
            detail_capacity: 100,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `INSIGHTARXIV_`)
/// 3. Workspace-local config (`.insightarxiv/config.toml`)
/// 4. User config (`~/.config/insightarxiv/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&FeedConfig>,
) -> Result<FeedConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(FeedConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "insightarxiv", "insightarxiv")
    {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".insightarxiv").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // INSIGHTARXIV_LOADER__TIMEOUT_SECS, INSIGHTARXIV_OFFLINE__PORT, etc.
    figment = figment.merge(Env::prefixed("INSIGHTARXIV_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "insightarxiv", "insightarxiv")
    {
        if config_dir.config_dir().join("config.toml").exists() {
            return true;
        }
    }

    if let Some(ws) = workspace {
        if ws.join(".insightarxiv").join("config.toml").exists() {
            return true;
        }
    }

    false
}

/// Render a configuration as TOML, the format the config files use.
pub fn to_toml(config: &FeedConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
