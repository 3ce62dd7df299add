//! Common plumbing shared across CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use depthproof_core::{
    AttestationController, DeviceKeyManager, FileKeyStore, FileQueueStore, HttpChallengeService,
    HttpUploadClient, NetworkMonitor, PipelineConfig, SoftwareAttestationProvider, UploadQueue,
};
use tracing::debug;

/// On-disk state of one CLI "device": keys, cached photos and the queue.
pub struct Workspace {
    data_dir: PathBuf,
    config: PipelineConfig,
    keystore: Arc<FileKeyStore>,
    provider: Arc<SoftwareAttestationProvider>,
}

impl Workspace {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let captures = data_dir.join("captures");
        std::fs::create_dir_all(&captures)
            .with_context(|| format!("Failed to create data directory: {}", captures.display()))?;

        let config = PipelineConfig {
            device_model: format!("depthproof-cli/{}", env!("CARGO_PKG_VERSION")),
            has_depth_sensor: false,
            ..PipelineConfig::from_env()
        };
        let keystore = Arc::new(FileKeyStore::new(data_dir.join("keys")));
        let provider = Arc::new(SoftwareAttestationProvider::new(
            keystore.clone(),
            config.backend_host(),
        ));
        debug!(data_dir = %data_dir.display(), api_url = %config.api_url, "Opened workspace");

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            keystore,
            provider,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn provider(&self) -> Arc<SoftwareAttestationProvider> {
        self.provider.clone()
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.cbor")
    }

    /// Attestation controller over the software key. Nothing touches the
    /// network until `ensure_attested` is called.
    pub fn attestation(&self) -> Result<Arc<AttestationController>> {
        let keys = Arc::new(DeviceKeyManager::new(
            self.provider.clone(),
            self.keystore.clone(),
            &self.config.backend_host(),
            self.config.key_generation_timeout,
        ));
        let service = HttpChallengeService::new(
            &self.config.api_url,
            self.config.request_timeout,
            self.config.allow_insecure_http,
        )
        .context("Failed to create network client")?;

        Ok(Arc::new(AttestationController::new(
            keys,
            self.provider.clone(),
            Arc::new(service),
            self.keystore.clone(),
            &self.config,
        )))
    }

    /// Open the persisted upload queue. `device_id` is sent with uploads
    /// once the device is registered.
    pub async fn queue(&self, device_id: Option<String>) -> Result<UploadQueue> {
        let mut client = HttpUploadClient::new(
            &self.config.api_url,
            self.config.request_timeout,
            self.config.allow_insecure_http,
        )
        .context("Failed to create network client")?;
        if let Some(device_id) = device_id {
            client = client.with_device_id(device_id);
        }

        UploadQueue::open(
            Arc::new(FileQueueStore::new(self.queue_path())),
            Arc::new(client),
            NetworkMonitor::always_online(),
            &self.config,
        )
        .await
        .context("Failed to open upload queue")
    }
}

/// Format an optional UTC time for tables.
pub fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// File modification time in epoch milliseconds.
pub fn modified_ms(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_time() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 45).unwrap();
        assert_eq!(format_time(Some(at)), "2024-01-15 12:30:45 UTC");
        assert_eq!(format_time(None), "-");
    }

    #[test]
    fn test_workspace_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        assert!(workspace.captures_dir().is_dir());
        assert_eq!(workspace.queue_path(), dir.path().join("queue.cbor"));
    }
}
