//! Named response caches, optionally persisted to disk.
//!
//! Each cache maps a request URL to the last successful response stored
//! for it. With a persistence directory every cache is mirrored to
//! `<dir>/<name>.json` (bodies base64-encoded) after each change, and
//! [`CacheStorage::restore`] reloads them on startup.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::protocol::CacheInfo;
use crate::error::OfflineError;
use crate::persistence;

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// Header names are lowercased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "base64_body")]
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(status: u16, headers: BTreeMap<String, String>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: Utc::now(),
        }
    }

    /// A plain-text response.
    pub fn text(status: u16, body: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        );
        Self::new(status, headers, Bytes::copy_from_slice(body.as_bytes()))
    }

    /// A JSON response.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self::new(status, headers, Bytes::from(value.to_string()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

type Entries = BTreeMap<String, CachedResponse>;

/// On-disk form of one cache.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    name: String,
    entries: Entries,
}

/// The set of named caches.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<BTreeMap<String, Entries>>,
    persist_dir: Option<PathBuf>,
    // Serializes map updates with their file writes.
    write_lock: Mutex<()>,
}

impl CacheStorage {
    /// Memory-only storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage mirrored to `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            persist_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn persist_dir(&self) -> Option<&Path> {
        self.persist_dir.as_deref()
    }

    /// Load every persisted cache. Returns the number of caches restored.
    ///
    /// Unreadable cache files are skipped with a warning; an unreadable
    /// directory is an error. A missing directory restores nothing.
    pub async fn restore(&self) -> Result<usize, OfflineError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(0);
        };
        let restore_err = |e: std::io::Error| OfflineError::Restore {
            path: dir.clone(),
            message: e.to_string(),
        };

        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(restore_err(e)),
        };

        let mut restored = BTreeMap::new();
        while let Some(entry) = reader.next_entry().await.map_err(restore_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            match serde_json::from_slice::<PersistedCache>(&data) {
                Ok(cache) => {
                    debug!(cache = %cache.name, entries = cache.entries.len(), "Restored cache");
                    restored.insert(cache.name, cache.entries);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt cache file");
                }
            }
        }

        let count = restored.len();
        self.caches.write().await.extend(restored);
        Ok(count)
    }

    /// Create `name` if it does not exist.
    pub async fn open(&self, name: &str) {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default();
    }

    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Store `response` under `key` in cache `name`, creating the cache.
    pub async fn put(
        &self,
        name: &str,
        key: &str,
        response: CachedResponse,
    ) -> Result<(), OfflineError> {
        // Held from the map update through the file write, so snapshots
        // reach disk in the order they were taken.
        let _guard = match &self.persist_dir {
            Some(_) => Some(self.write_lock.lock().await),
            None => None,
        };
        let snapshot = {
            let mut caches = self.caches.write().await;
            let entries = caches.entry(name.to_string()).or_default();
            entries.insert(key.to_string(), response);
            self.persist_dir.as_ref().map(|_| entries.clone())
        };
        match snapshot {
            Some(entries) => self.persist(name, entries).await,
            None => Ok(()),
        }
    }

    pub async fn get(&self, name: &str, key: &str) -> Option<CachedResponse> {
        self.caches
            .read()
            .await
            .get(name)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    /// Look `key` up in every cache, in name order.
    pub async fn match_any(&self, key: &str) -> Option<CachedResponse> {
        self.caches
            .read()
            .await
            .values()
            .find_map(|entries| entries.get(key))
            .cloned()
    }

    /// Drop cache `name` and its file. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, OfflineError> {
        let _guard = match &self.persist_dir {
            Some(_) => Some(self.write_lock.lock().await),
            None => None,
        };
        let existed = self.caches.write().await.remove(name).is_some();
        if let Some(dir) = &self.persist_dir {
            match tokio::fs::remove_file(cache_file(dir, name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(OfflineError::Persist {
                        name: name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(existed)
    }

    pub async fn names(&self) -> Vec<String> {
        self.caches.read().await.keys().cloned().collect()
    }

    /// Entry count and body size of every cache.
    pub async fn info(&self) -> Vec<CacheInfo> {
        self.caches
            .read()
            .await
            .iter()
            .map(|(name, entries)| CacheInfo {
                name: name.clone(),
                entries: entries.len(),
                bytes: entries.values().map(|r| r.body.len() as u64).sum(),
            })
            .collect()
    }

    /// Write a snapshot of cache `name`. Callers hold `write_lock`.
    async fn persist(&self, name: &str, entries: Entries) -> Result<(), OfflineError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let persist_err = |message: String| OfflineError::Persist {
            name: name.to_string(),
            message,
        };
        let data = serde_json::to_vec(&PersistedCache {
            name: name.to_string(),
            entries,
        })
        .map_err(|e| persist_err(e.to_string()))?;

        persistence::write_atomic_async(&cache_file(dir, name), &data)
            .await
            .map_err(|e| persist_err(e.to_string()))
    }
}

/// File holding cache `name`; characters outside `[A-Za-z0-9._-]` become `_`.
fn cache_file(dir: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{safe}.json"))
}
