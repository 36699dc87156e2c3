//! Control messages accepted by the offline cache.

use serde::{Deserialize, Serialize};

/// A control message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate a waiting cache immediately. No reply.
    SkipWaiting,
    GetVersion,
    GetCacheInfo,
    /// Delete every cache.
    ClearCache,
}

/// Size of one named cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub name: String,
    pub entries: usize,
    pub bytes: u64,
}

/// Reply to a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    CacheInfo {
        version: String,
        caches: Vec<CacheInfo>,
    },
    Version {
        version: String,
    },
    Cleared {
        success: bool,
    },
}
