//! Best-effort persistence.
//!
//! A `KvStore` holds opaque snapshots by key. A `SnapshotWriter` owns one
//! background task per key that renders and stores a snapshot whenever it is
//! asked to. Requests arriving while one is already pending collapse into it,
//! so a burst of mutations costs at most one extra write and there is never
//! more than one writer per key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Key-value persistence layer.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// Something that can serialize its current state on demand.
#[async_trait]
pub trait Snapshot: Send + Sync {
    async fn render(&self) -> Result<Vec<u8>>;
}

// ============================================================================
// Stores
// ============================================================================

/// One `<key>.json` file per key inside `dir`.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl KvStore for JsonDirStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read snapshot '{}'", key)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
        Ok(())
    }
}

/// In-process store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

struct WriterShared {
    key: String,
    store: Arc<dyn KvStore>,
    source: Arc<dyn Snapshot>,
    /// Serializes background writes with explicit `flush` calls.
    write_lock: Mutex<()>,
}

impl WriterShared {
    async fn write(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = self.source.render().await?;
        self.store.put(&self.key, bytes).await
    }
}

/// Dedicated background writer for one snapshot key.
pub struct SnapshotWriter {
    tx: mpsc::Sender<()>,
    shared: Arc<WriterShared>,
}

impl SnapshotWriter {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(
        key: impl Into<String>,
        store: Arc<dyn KvStore>,
        source: Arc<dyn Snapshot>,
    ) -> Self {
        let shared = Arc::new(WriterShared {
            key: key.into(),
            store,
            source,
            write_lock: Mutex::new(()),
        });
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                if let Err(e) = task_shared.write().await {
                    tracing::warn!("Snapshot '{}' failed: {:#}", task_shared.key, e);
                }
            }
            tracing::debug!("Snapshot writer '{}' stopped", task_shared.key);
        });

        Self { tx, shared }
    }

    /// Ask for a snapshot. Never blocks; coalesces with a pending request.
    pub fn request(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.tx.try_send(()) {
            tracing::debug!("Snapshot writer '{}' is gone", self.shared.key);
        }
    }

    /// Write a snapshot now and report the outcome.
    pub async fn flush(&self) -> Result<()> {
        self.shared.write().await
    }
}
