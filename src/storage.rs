//! Storage collaborators.
//!
//! Storage backends are external collaborators; the hub depends on them only
//! through the [`QueueStore`] contract: `append` a categorized payload and
//! get back the new entry count, optionally `consume` entries back out.
//! Durability, replication, and query are the backend's business, not ours.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppResult, HubError};

/// One stored entry: the payload as handed to `append`, plus the tag the
/// store generated for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRequest {
    pub tag: String,
    pub category: String,
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl StoredRequest {
    fn new(category: &str, payload: &[u8]) -> Self {
        Self {
            // Category-prefixed tag, one per entry.
            tag: format!("{}:{}", category, Uuid::new_v4()),
            category: category.to_string(),
            payload: payload.to_vec(),
            stored_at: Utc::now(),
        }
    }
}

/// Contract between the hub and a storage backend.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts one entry and returns the new entry count.
    async fn append(&self, category: &str, payload: &[u8]) -> AppResult<u64>;

    /// Removes and returns the oldest entry, or `None` if the store is empty
    /// or write-only.
    async fn consume(&self) -> AppResult<Option<StoredRequest>>;

    /// Current entry count.
    async fn count(&self) -> u64;
}

/// In-memory store, mainly for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<VecDeque<StoredRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn append(&self, category: &str, payload: &[u8]) -> AppResult<u64> {
        let mut entries = self.entries.lock();
        entries.push_back(StoredRequest::new(category, payload));
        Ok(entries.len() as u64)
    }

    async fn consume(&self) -> AppResult<Option<StoredRequest>> {
        Ok(self.entries.lock().pop_front())
    }

    async fn count(&self) -> u64 {
        self.entries.lock().len() as u64
    }
}

/// Append-only store writing one JSON line per entry to a timestamped file.
///
/// Write-only: `consume` always returns `None`; readers are external
/// processes tailing the file.
pub struct JsonlStore {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

struct JsonlState {
    file: std::fs::File,
    count: u64,
}

impl JsonlStore {
    /// Creates `ingest_<timestamp>.jsonl` under `dir`, creating the
    /// directory if needed.
    pub fn create(dir: impl AsRef<Path>) -> AppResult<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        let file_name = format!("ingest_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(file_name);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        info!("JSONL store writing to '{}'", path.display());
        Ok(Self {
            path,
            state: Mutex::new(JsonlState { file, count: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueueStore for JsonlStore {
    async fn append(&self, category: &str, payload: &[u8]) -> AppResult<u64> {
        let entry = StoredRequest::new(category, payload);
        let line = serde_json::to_string(&entry)?;
        let mut state = self.state.lock();
        writeln!(state.file, "{line}").map_err(|e| HubError::Storage(e.to_string()))?;
        state.count += 1;
        debug!("Stored entry {} ({} total)", entry.tag, state.count);
        Ok(state.count)
    }

    async fn consume(&self) -> AppResult<Option<StoredRequest>> {
        Ok(None)
    }

    async fn count(&self) -> u64 {
        self.state.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_appends_and_consumes_fifo() {
        let store = MemoryStore::new();
        assert_eq!(store.append("MQTT", b"first").await.unwrap(), 1);
        assert_eq!(store.append("RAW", b"second").await.unwrap(), 2);
        assert_eq!(store.count().await, 2);

        let first = store.consume().await.unwrap().unwrap();
        assert_eq!(first.category, "MQTT");
        assert_eq!(first.payload, b"first");
        assert!(first.tag.starts_with("MQTT:"));

        let second = store.consume().await.unwrap().unwrap();
        assert_eq!(second.payload, b"second");
        assert!(store.consume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn jsonl_store_writes_one_line_per_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::create(dir.path()).unwrap();
        assert_eq!(store.append("RAW", b"heartbeat").await.unwrap(), 1);
        assert_eq!(store.append("RAW", b"echo").await.unwrap(), 2);
        assert_eq!(store.count().await, 2);
        assert!(store.consume().await.unwrap().is_none());

        let contents = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: StoredRequest = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.category, "RAW");
        assert_eq!(first.payload, b"heartbeat");
    }
}
