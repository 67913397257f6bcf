//! Persistence for rate-limit trackers.
//!
//! Durable storage is best effort. Every write lands in an in-memory map
//! partitioned by instance signature first, and reads are answered from that
//! map. Durable storage is consulted only for keys this process has not
//! touched yet. Durable failures are logged and never reset a window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Timestamps (epoch ms) of admitted requests for one partition key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTracker {
    pub timestamps: Vec<u64>,
    pub last_cleanup: u64,
}

impl RateLimitTracker {
    pub fn new(now_ms: u64) -> Self {
        Self {
            timestamps: Vec::new(),
            last_cleanup: now_ms,
        }
    }
}

/// Key under which a tracker is persisted.
pub fn record_key(signature: &str, key: &str) -> String {
    format!("{signature}_{key}")
}

/// A durable keyed store for trackers.
pub trait TrackerStore: Send + Sync {
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<RateLimitTracker>, StoreError>>;

    fn save<'a>(
        &'a self,
        key: &'a str,
        tracker: &'a RateLimitTracker,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// One JSON file per record key in a directory.
///
/// File names are the hex encoding of the record key, so arbitrary partition
/// keys never escape the directory.
pub struct FileTrackerStore {
    dir: PathBuf,
}

impl FileTrackerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

impl TrackerStore for FileTrackerStore {
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<RateLimitTracker>, StoreError>> {
        Box::pin(async move {
            match tokio::fs::read(self.path_for(key)).await {
                Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn save<'a>(
        &'a self,
        key: &'a str,
        tracker: &'a RateLimitTracker,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            let content = serde_json::to_vec(tracker)?;
            replace_file(&self.path_for(key), &content).await
        })
    }
}

/// Sequence for scratch files, so concurrent saves of one record inside this
/// process never share a temp path.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `bytes` in one rename. A reader sees either the old
/// tracker or the new one, never a partial file.
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let scratch = path.with_extension(format!("{}-{seq}.partial", std::process::id()));
    tokio::fs::write(&scratch, bytes).await?;
    match tokio::fs::rename(&scratch, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&scratch).await {
                tracing::debug!(path = %scratch.display(), error = %cleanup, "scratch file left behind");
            }
            Err(e.into())
        }
    }
}

/// In-memory trackers, partitioned by instance signature, then partition key.
#[derive(Debug, Default)]
pub struct MemoryTrackerStore {
    trackers: Mutex<HashMap<String, HashMap<String, RateLimitTracker>>>,
}

impl MemoryTrackerStore {
    pub fn get(&self, signature: &str, key: &str) -> Option<RateLimitTracker> {
        self.trackers
            .lock()
            .ok()?
            .get(signature)
            .and_then(|scoped| scoped.get(key))
            .cloned()
    }

    pub fn put(&self, signature: &str, key: &str, tracker: RateLimitTracker) {
        if let Ok(mut trackers) = self.trackers.lock() {
            trackers
                .entry(signature.to_string())
                .or_default()
                .insert(key.to_string(), tracker);
        }
    }

    /// Number of partition keys tracked under `signature`.
    pub fn len(&self, signature: &str) -> usize {
        self.trackers
            .lock()
            .map(|t| t.get(signature).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, signature: &str) -> bool {
        self.len(signature) == 0
    }
}

/// Storage shared by every rate-limit middleware that is handed the same
/// `Arc<RateLimitStorage>`.
pub struct RateLimitStorage {
    durable: Option<Arc<dyn TrackerStore>>,
    memory: MemoryTrackerStore,
}

impl Default for RateLimitStorage {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl RateLimitStorage {
    pub fn in_memory() -> Self {
        Self {
            durable: None,
            memory: MemoryTrackerStore::default(),
        }
    }

    pub fn with_durable(store: Arc<dyn TrackerStore>) -> Self {
        Self {
            durable: Some(store),
            memory: MemoryTrackerStore::default(),
        }
    }

    /// Durable storage backed by JSON files in `dir`.
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::with_durable(Arc::new(FileTrackerStore::new(dir)))
    }

    pub fn memory(&self) -> &MemoryTrackerStore {
        &self.memory
    }

    /// Load a tracker. Never fails.
    ///
    /// The in-memory mirror is consulted first: every save lands there, so
    /// within one process it is never older than the durable copy, even after
    /// a durable write failed. The durable store only answers for keys this
    /// process has not touched yet (for example after a restart).
    pub async fn load(&self, signature: &str, key: &str) -> Option<RateLimitTracker> {
        if let Some(tracker) = self.memory.get(signature, key) {
            return Some(tracker);
        }
        let durable = self.durable.as_ref()?;
        let record = record_key(signature, key);
        match durable.load(&record).await {
            Ok(Some(tracker)) => {
                self.memory.put(signature, key, tracker.clone());
                Some(tracker)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %record, error = %e, "rate limit store read failed, starting a fresh window");
                None
            }
        }
    }

    /// Persist a tracker. Never fails: durable errors are logged.
    pub async fn save(&self, signature: &str, key: &str, tracker: &RateLimitTracker) {
        self.memory.put(signature, key, tracker.clone());
        if let Some(durable) = &self.durable {
            let record = record_key(signature, key);
            if let Err(e) = durable.save(&record, tracker).await {
                tracing::warn!(key = %record, error = %e, "rate limit store write failed, kept in memory");
            }
        }
    }
}
