//! Durable storage for the upload queue.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::QueuedCapture;
use crate::error::StorageError;
use crate::keystore::write_atomic;

const QUEUE_FILE_VERSION: u32 = 1;

/// Persistence for queue items. The queue saves the full item list after
/// every mutation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> Result<Vec<QueuedCapture>, StorageError>;
    async fn save(&self, items: &[QueuedCapture]) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryQueueStore {
    items: Mutex<Vec<QueuedCapture>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate state left by a previous run.
    pub fn with_items(items: Vec<QueuedCapture>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub async fn items(&self) -> Vec<QueuedCapture> {
        self.items.lock().await.clone()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<QueuedCapture>, StorageError> {
        Ok(self.items.lock().await.clone())
    }

    async fn save(&self, items: &[QueuedCapture]) -> Result<(), StorageError> {
        *self.items.lock().await = items.to_vec();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    items: Vec<QueuedCapture>,
}

/// Single CBOR file, replaced atomically on every save.
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self) -> Result<Vec<QueuedCapture>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let file: QueueFile = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| StorageError::Corrupted(format!("{}: {e}", self.path.display())))?;
        if file.version != QUEUE_FILE_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported queue file version {}",
                file.version
            )));
        }
        Ok(file.items)
    }

    async fn save(&self, items: &[QueuedCapture]) -> Result<(), StorageError> {
        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            items: items.to_vec(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&file, &mut bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), items = items.len(), "Queue saved");
        Ok(())
    }
}
