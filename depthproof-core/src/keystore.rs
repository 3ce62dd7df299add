//! Secure key-value storage for device identity material.
//!
//! On devices this is backed by the platform keychain/keystore; the stores here
//! cover tests ([`MemoryKeyStore`]) and the CLI ([`FileKeyStore`]). Every entry
//! is scoped by backend host through [`scoped_id`], so one installation can hold
//! separate registrations per environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;

/// Build a storage id scoped to a backend host.
pub fn scoped_id(host: &str, name: &str) -> String {
    format!("{host}/{name}")
}

/// Secure storage contract consumed by the key and attestation managers.
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, id: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, id: &str) -> Result<(), StorageError>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureKeyStore for MemoryKeyStore {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().await.get(id).cloned())
    }

    async fn set(&self, id: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries
            .lock()
            .await
            .insert(id.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.entries.lock().await.remove(id);
        Ok(())
    }
}

/// Directory-backed store. One file per entry, owner-readable only on unix.
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.key", hex::encode(id.as_bytes())))
    }
}

#[async_trait]
impl SecureKeyStore for FileKeyStore {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, id: &str, value: &[u8]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(id);
        write_atomic(&path, value).await?;
        debug!(path = %path.display(), "Stored secure entry");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write through a temporary sibling and rename, so readers never see a torn file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&tmp, path).await
}
