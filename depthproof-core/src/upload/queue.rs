use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    NetworkMonitor, QueueStore, RemoteStatus, RetryPolicy, UploadClient, UploadProgress,
    UploadReceipt,
};
use crate::config::PipelineConfig;
use crate::error::{QueueError, UploadError};
use crate::processor::ProcessedCapture;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Failed,
    PermanentlyFailed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capture and its upload bookkeeping. Only the queue mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCapture {
    pub capture: ProcessedCapture,
    pub status: UploadStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    /// Earliest retry time while `Failed`.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<UploadError>,
    pub receipt: Option<UploadReceipt>,
}

impl QueuedCapture {
    pub fn new(capture: ProcessedCapture, queued_at: DateTime<Utc>) -> Self {
        Self {
            capture,
            status: UploadStatus::Pending,
            retry_count: 0,
            queued_at,
            next_attempt_at: None,
            last_error: None,
            receipt: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.capture.id()
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == UploadStatus::Failed && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    StatusChanged { id: Uuid, status: UploadStatus },
    Progress { id: Uuid, progress: UploadProgress },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub uploading: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub permanently_failed: usize,
}

/// Outcome of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub attempted: usize,
    pub completed: usize,
    pub retry_scheduled: usize,
    pub permanently_failed: usize,
    /// The pass stopped because the in-flight upload was cancelled.
    pub cancelled: bool,
}

struct InFlight {
    id: Uuid,
    cancel: Arc<Notify>,
}

struct QueueState {
    items: Vec<QueuedCapture>,
    in_flight: Option<InFlight>,
}

/// Single-consumer upload queue.
///
/// At most one item is `Uploading` at any time: passes are serialized by
/// `processing`, and selection of the next item happens under the state lock.
/// Uploads only start while the [`NetworkMonitor`] reports the device online;
/// going offline stops the pass without touching item statuses.
pub struct UploadQueue {
    state: Mutex<QueueState>,
    processing: Mutex<()>,
    store: Arc<dyn QueueStore>,
    client: Arc<dyn UploadClient>,
    network: NetworkMonitor,
    policy: RetryPolicy,
    inter_item_delay: Duration,
    cleanup_after_upload: bool,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl UploadQueue {
    /// Load persisted items and recover uploads interrupted by a restart.
    ///
    /// `Uploading` items go back to `Pending`. `Processing` items were already
    /// accepted by the backend and become `Completed`.
    pub async fn open(
        store: Arc<dyn QueueStore>,
        client: Arc<dyn UploadClient>,
        network: NetworkMonitor,
        config: &PipelineConfig,
    ) -> Result<Self, QueueError> {
        let mut items = store.load().await?;

        let mut recovered = 0usize;
        for item in &mut items {
            let recovered_status = match item.status {
                UploadStatus::Uploading => UploadStatus::Pending,
                UploadStatus::Processing => UploadStatus::Completed,
                _ => continue,
            };
            debug!(capture_id = %item.id(), from = %item.status, to = %recovered_status, "Recovering interrupted upload");
            item.status = recovered_status;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "Recovered uploads interrupted by restart");
            store.save(&items).await?;
        }

        info!(items = items.len(), "Upload queue opened");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            state: Mutex::new(QueueState {
                items,
                in_flight: None,
            }),
            processing: Mutex::new(()),
            store,
            client,
            network,
            policy: config.upload_retry,
            inter_item_delay: config.inter_item_delay,
            cleanup_after_upload: config.cleanup_after_upload,
            wake: Notify::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    #[instrument(level = "debug", skip_all, fields(capture_id = %capture.id()))]
    pub async fn enqueue(&self, capture: ProcessedCapture) -> Result<(), QueueError> {
        let id = capture.id();
        {
            let mut state = self.state.lock().await;
            if state.items.iter().any(|item| item.id() == id) {
                return Err(QueueError::Duplicate(id.to_string()));
            }
            state.items.push(QueuedCapture::new(capture, Utc::now()));
            if let Err(e) = self.store.save(&state.items).await {
                state.items.pop();
                return Err(e.into());
            }
        }

        info!("Capture queued for upload");
        self.emit_status(id, UploadStatus::Pending);
        self.wake.notify_one();
        Ok(())
    }

    /// Run one pass now. Returns immediately if another pass is running.
    ///
    /// Retries are scheduled from the moment each upload attempt ends.
    pub async fn process(&self) -> ProcessSummary {
        self.try_pass(None).await
    }

    /// Run one pass with the clock frozen at `now`, both for picking due
    /// retries and for scheduling new ones.
    pub async fn process_at(&self, now: DateTime<Utc>) -> ProcessSummary {
        self.try_pass(Some(now)).await
    }

    async fn try_pass(&self, clock: Option<DateTime<Utc>>) -> ProcessSummary {
        let Ok(_processing) = self.processing.try_lock() else {
            debug!("Upload pass already running");
            return ProcessSummary::default();
        };
        self.pass(clock).await
    }

    /// Background worker. Processes whenever an item is enqueued or retried,
    /// the network comes back, or a retry falls due.
    pub async fn run(&self) {
        info!("Upload worker started");
        loop {
            {
                let _processing = self.processing.lock().await;
                self.pass(None).await;
            }

            let offline = !self.network.is_online();
            let next_retry = self.next_retry_at().await;
            let retry_due = async {
                match next_retry {
                    Some(at) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.wake.notified() => debug!("Upload worker woken"),
                _ = self.network.wait_online(), if offline => debug!("Network available, resuming uploads"),
                _ = retry_due, if !offline => debug!("Upload retry due"),
            }
        }
    }

    /// `clock` pins the current time; `None` reads the wall clock each time.
    async fn pass(&self, clock: Option<DateTime<Utc>>) -> ProcessSummary {
        let now = || clock.unwrap_or_else(Utc::now);
        let mut summary = ProcessSummary::default();
        loop {
            if !self.network.is_online() {
                debug!("Network unavailable, uploads paused");
                break;
            }
            let Some((capture, cancel)) = self.begin_next(now()).await else {
                break;
            };
            summary.attempted += 1;

            let id = capture.id();
            let events = self.events.clone();
            let progress = move |progress: UploadProgress| {
                let _ = events.send(QueueEvent::Progress { id, progress });
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.notified() => None,
                result = self.client.upload(&capture, &progress) => Some(result),
            };
            let cancelled = outcome.is_none();
            self.finish(&capture, outcome, now(), &mut summary).await;

            if cancelled {
                summary.cancelled = true;
                break;
            }
            if !self.has_ready(now()).await {
                break;
            }
            tokio::time::sleep(self.inter_item_delay).await;
        }
        summary
    }

    /// Promote due retries, then move the oldest `Pending` item to `Uploading`.
    async fn begin_next(&self, now: DateTime<Utc>) -> Option<(ProcessedCapture, Arc<Notify>)> {
        let mut state = self.state.lock().await;

        let mut promoted = Vec::new();
        for item in state.items.iter_mut().filter(|item| item.is_due(now)) {
            item.status = UploadStatus::Pending;
            item.next_attempt_at = None;
            promoted.push(item.id());
        }

        let index = state
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == UploadStatus::Pending)
            .min_by_key(|(_, item)| item.queued_at)
            .map(|(index, _)| index)?;

        let cancel = Arc::new(Notify::new());
        let item = &mut state.items[index];
        item.status = UploadStatus::Uploading;
        let capture = item.capture.clone();
        state.in_flight = Some(InFlight {
            id: capture.id(),
            cancel: Arc::clone(&cancel),
        });
        self.persist(&state.items).await;
        drop(state);

        for id in promoted {
            self.emit_status(id, UploadStatus::Pending);
        }
        debug!(capture_id = %capture.id(), "Upload started");
        self.emit_status(capture.id(), UploadStatus::Uploading);
        Some((capture, cancel))
    }

    /// Record the outcome of an attempt. Retries are scheduled from `ended_at`.
    async fn finish(
        &self,
        capture: &ProcessedCapture,
        outcome: Option<Result<UploadReceipt, UploadError>>,
        ended_at: DateTime<Utc>,
        summary: &mut ProcessSummary,
    ) {
        let id = capture.id();
        let mut transitions = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.in_flight = None;
            let Some(index) = state.items.iter().position(|item| item.id() == id) else {
                warn!(capture_id = %id, "Uploaded capture is no longer queued");
                return;
            };

            match outcome {
                None => {
                    state.items[index].status = UploadStatus::Pending;
                    transitions.push(UploadStatus::Pending);
                    info!(capture_id = %id, "Upload cancelled, capture left pending");
                }
                Some(Ok(receipt)) => {
                    if receipt.status == RemoteStatus::Processing {
                        // Accepted but not yet verified: a crash from here on
                        // must not upload the capture again.
                        state.items[index].status = UploadStatus::Processing;
                        self.persist(&state.items).await;
                        transitions.push(UploadStatus::Processing);
                    }
                    let item = &mut state.items[index];
                    info!(
                        capture_id = %id,
                        remote_id = %receipt.capture_id,
                        retry_count = item.retry_count,
                        "Upload completed"
                    );
                    item.status = UploadStatus::Completed;
                    item.next_attempt_at = None;
                    item.last_error = None;
                    item.receipt = Some(receipt);
                    if self.cleanup_after_upload {
                        item.capture.release_depth_map();
                    }
                    transitions.push(UploadStatus::Completed);
                    summary.completed += 1;
                }
                Some(Err(error)) => {
                    let item = &mut state.items[index];
                    item.retry_count += 1;
                    transitions.push(UploadStatus::Failed);
                    if !error.is_retryable() || self.policy.is_exhausted(item.retry_count) {
                        warn!(
                            capture_id = %id,
                            retry_count = item.retry_count,
                            kind = error.kind(),
                            error = %error,
                            "Upload permanently failed"
                        );
                        item.status = UploadStatus::PermanentlyFailed;
                        item.next_attempt_at = None;
                        transitions.push(UploadStatus::PermanentlyFailed);
                        summary.permanently_failed += 1;
                    } else {
                        let delay = self.policy.next_delay(&error, item.retry_count, &id);
                        warn!(
                            capture_id = %id,
                            retry_count = item.retry_count,
                            kind = error.kind(),
                            retry_in_ms = delay.as_millis() as u64,
                            error = %error,
                            "Upload failed, retry scheduled"
                        );
                        item.status = UploadStatus::Failed;
                        item.next_attempt_at = Some(
                            chrono::Duration::from_std(delay)
                                .ok()
                                .and_then(|delta| ended_at.checked_add_signed(delta))
                                .unwrap_or(DateTime::<Utc>::MAX_UTC),
                        );
                        summary.retry_scheduled += 1;
                    }
                    item.last_error = Some(error);
                }
            }
            self.persist(&state.items).await;
        }

        for status in &transitions {
            self.emit_status(id, *status);
        }
        if self.cleanup_after_upload && transitions.last() == Some(&UploadStatus::Completed) {
            schedule_cleanup(id, capture.photo_path().to_path_buf());
        }
    }

    /// Cancel the in-flight upload of `id`. The item returns to `Pending`.
    pub async fn cancel_upload(&self, id: Uuid) -> Result<(), QueueError> {
        let state = self.state.lock().await;
        if let Some(in_flight) = state.in_flight.as_ref().filter(|f| f.id == id) {
            in_flight.cancel.notify_one();
            info!(capture_id = %id, "Upload cancellation requested");
            return Ok(());
        }
        match state.items.iter().find(|item| item.id() == id) {
            Some(item) => Err(QueueError::InvalidState {
                id: id.to_string(),
                status: item.status.to_string(),
            }),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    /// Requeue a failed or permanently failed item with a fresh attempt budget.
    pub async fn retry(&self, id: Uuid) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let item = state
                .items
                .iter_mut()
                .find(|item| item.id() == id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if !matches!(
                item.status,
                UploadStatus::Failed | UploadStatus::PermanentlyFailed
            ) {
                return Err(QueueError::InvalidState {
                    id: id.to_string(),
                    status: item.status.to_string(),
                });
            }
            reset_for_retry(item);
            self.store.save(&state.items).await?;
        }

        info!(capture_id = %id, "Upload requeued");
        self.emit_status(id, UploadStatus::Pending);
        self.wake.notify_one();
        Ok(())
    }

    /// Requeue every failed and permanently failed item.
    pub async fn retry_all_failed(&self) -> Result<usize, QueueError> {
        let requeued: Vec<Uuid> = {
            let mut state = self.state.lock().await;
            let requeued: Vec<Uuid> = state
                .items
                .iter_mut()
                .filter(|item| {
                    matches!(
                        item.status,
                        UploadStatus::Failed | UploadStatus::PermanentlyFailed
                    )
                })
                .map(|item| {
                    reset_for_retry(item);
                    item.id()
                })
                .collect();
            if !requeued.is_empty() {
                self.store.save(&state.items).await?;
            }
            requeued
        };

        for id in &requeued {
            self.emit_status(*id, UploadStatus::Pending);
        }
        if !requeued.is_empty() {
            info!(count = requeued.len(), "Failed uploads requeued");
            self.wake.notify_one();
        }
        Ok(requeued.len())
    }

    /// Drop an item that is not currently uploading.
    pub async fn remove(&self, id: Uuid) -> Result<QueuedCapture, QueueError> {
        let mut state = self.state.lock().await;
        let index = state
            .items
            .iter()
            .position(|item| item.id() == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if state.items[index].status == UploadStatus::Uploading {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: UploadStatus::Uploading.to_string(),
            });
        }

        let removed = state.items.remove(index);
        if let Err(e) = self.store.save(&state.items).await {
            state.items.insert(index, removed);
            return Err(e.into());
        }
        info!(capture_id = %id, status = %removed.status, "Capture removed from queue");
        Ok(removed)
    }

    pub async fn clear_completed(&self) -> Result<usize, QueueError> {
        self.clear_status(UploadStatus::Completed).await
    }

    pub async fn clear_permanently_failed(&self) -> Result<usize, QueueError> {
        self.clear_status(UploadStatus::PermanentlyFailed).await
    }

    async fn clear_status(&self, status: UploadStatus) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|item| item.status != status);
        let cleared = before - state.items.len();
        if cleared > 0 {
            self.store.save(&state.items).await?;
            info!(cleared, status = %status, "Queue cleared");
        }
        Ok(cleared)
    }

    pub async fn snapshot(&self) -> Vec<QueuedCapture> {
        self.state.lock().await.items.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<QueuedCapture> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for item in &state.items {
            match item.status {
                UploadStatus::Pending => stats.pending += 1,
                UploadStatus::Uploading => stats.uploading += 1,
                UploadStatus::Processing => stats.processing += 1,
                UploadStatus::Completed => stats.completed += 1,
                UploadStatus::Failed => stats.failed += 1,
                UploadStatus::PermanentlyFailed => stats.permanently_failed += 1,
            }
        }
        stats
    }

    /// Earliest scheduled retry among `Failed` items.
    pub async fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .filter(|item| item.status == UploadStatus::Failed)
            .filter_map(|item| item.next_attempt_at)
            .min()
    }

    async fn has_ready(&self, now: DateTime<Utc>) -> bool {
        self.state
            .lock()
            .await
            .items
            .iter()
            .any(|item| item.status == UploadStatus::Pending || item.is_due(now))
    }

    async fn persist(&self, items: &[QueuedCapture]) {
        if let Err(e) = self.store.save(items).await {
            error!(error = %e, "Failed to persist upload queue");
        }
    }

    fn emit_status(&self, id: Uuid, status: UploadStatus) {
        let _ = self.events.send(QueueEvent::StatusChanged { id, status });
    }
}

fn reset_for_retry(item: &mut QueuedCapture) {
    item.status = UploadStatus::Pending;
    item.retry_count = 0;
    item.next_attempt_at = None;
    item.last_error = None;
}

/// Best-effort removal of the uploaded photo, off the upload path.
fn schedule_cleanup(id: Uuid, path: PathBuf) {
    tokio::spawn(async move {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(capture_id = %id, "Removed uploaded photo"),
            Err(e) => warn!(
                capture_id = %id,
                path = %path.display(),
                error = %e,
                "Failed to remove uploaded photo"
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CapturedPhoto, DepthFrame, RawCapture};
    use crate::processor::CaptureProcessor;
    use crate::upload::{
        ConnectionType, FileQueueStore, MemoryQueueStore, NetworkStatus, ScriptedUploadClient,
    };
    use tempfile::TempDir;

    async fn capture(dir: &TempDir, name: &str) -> ProcessedCapture {
        let path = dir.path().join(format!("{name}.jpg"));
        tokio::fs::write(&path, name.as_bytes()).await.unwrap();
        let raw = RawCapture::assemble(
            CapturedPhoto {
                path,
                width: 640,
                height: 480,
                exif: None,
            },
            DepthFrame {
                width: 2,
                height: 2,
                timestamp_ms: 1_700_000_000_000,
                depth_map: vec![7; 16],
            },
            1_700_000_000_000,
            None,
            100,
        )
        .unwrap();
        CaptureProcessor::new(&PipelineConfig::default())
            .process(&raw, None)
            .await
            .unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            inter_item_delay: Duration::ZERO,
            cleanup_after_upload: false,
            ..PipelineConfig::default()
        }
    }

    async fn open(
        client: Arc<ScriptedUploadClient>,
        network: NetworkMonitor,
        store: Arc<dyn QueueStore>,
        config: &PipelineConfig,
    ) -> UploadQueue {
        UploadQueue::open(store, client, network, config)
            .await
            .unwrap()
    }

    async fn online_queue(client: Arc<ScriptedUploadClient>) -> UploadQueue {
        open(
            client,
            NetworkMonitor::always_online(),
            Arc::new(MemoryQueueStore::new()),
            &config(),
        )
        .await
    }

    fn status_changes(events: &mut broadcast::Receiver<QueueEvent>) -> Vec<UploadStatus> {
        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::StatusChanged { status, .. } = event {
                statuses.push(status);
            }
        }
        statuses
    }

    #[tokio::test]
    async fn test_uploads_are_fifo_and_serialized() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::new().with_delay(Duration::from_millis(5)));
        let queue = online_queue(client.clone()).await;

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let capture = capture(&dir, name).await;
            ids.push(capture.id());
            queue.enqueue(capture).await.unwrap();
        }

        let (first, second) = tokio::join!(queue.process(), queue.process());
        assert_eq!(first.attempted + second.attempted, 3);
        assert_eq!(client.uploaded().await, ids);
        assert_eq!(client.max_in_flight(), 1);
        assert_eq!(queue.stats().await.completed, 3);
    }

    #[tokio::test]
    async fn test_backend_processing_then_completed() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::with_script(vec![Ok(
            RemoteStatus::Processing,
        )]));
        let queue = online_queue(client).await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        let mut events = queue.subscribe();
        queue.process().await;

        assert_eq!(
            status_changes(&mut events),
            vec![
                UploadStatus::Uploading,
                UploadStatus::Processing,
                UploadStatus::Completed
            ]
        );
        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::Completed);
        assert_eq!(
            item.receipt.map(|r| r.status),
            Some(RemoteStatus::Processing)
        );
    }

    /// Records the statuses written by every save.
    #[derive(Default)]
    struct RecordingStore {
        saves: Mutex<Vec<Vec<UploadStatus>>>,
    }

    #[async_trait::async_trait]
    impl QueueStore for RecordingStore {
        async fn load(&self) -> Result<Vec<QueuedCapture>, crate::error::StorageError> {
            Ok(Vec::new())
        }

        async fn save(&self, items: &[QueuedCapture]) -> Result<(), crate::error::StorageError> {
            let statuses = items.iter().map(|item| item.status).collect();
            self.saves.lock().await.push(statuses);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_processing_status_is_persisted_before_completion() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::with_script(vec![Ok(
            RemoteStatus::Processing,
        )]));
        let store = Arc::new(RecordingStore::default());
        let queue = open(client, NetworkMonitor::always_online(), store.clone(), &config()).await;
        queue.enqueue(capture(&dir, "a").await).await.unwrap();

        queue.process().await;

        let saves = store.saves.lock().await.clone();
        assert_eq!(
            saves,
            vec![
                vec![UploadStatus::Pending],
                vec![UploadStatus::Uploading],
                vec![UploadStatus::Processing],
                vec![UploadStatus::Completed],
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_after_sets_next_attempt() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::with_script(vec![Err(
            UploadError::RateLimited {
                retry_after_ms: Some(30_000),
            },
        )]));
        let queue = online_queue(client.clone()).await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        let now = Utc::now();
        let summary = queue.process_at(now).await;
        assert_eq!(summary.retry_scheduled, 1);

        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::Failed);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.next_attempt_at, Some(now + chrono::Duration::seconds(30)));

        let early = queue.process_at(now + chrono::Duration::seconds(29)).await;
        assert_eq!(early.attempted, 0);

        let due = queue.process_at(now + chrono::Duration::seconds(30)).await;
        assert_eq!(due.completed, 1);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_scheduled_from_response_time() {
        let dir = TempDir::new().unwrap();
        let upload_time = Duration::from_millis(300);
        let client = Arc::new(
            ScriptedUploadClient::with_script(vec![Err(UploadError::RateLimited {
                retry_after_ms: Some(30_000),
            })])
            .with_delay(upload_time),
        );
        let queue = online_queue(client).await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        let started = Utc::now();
        queue.process().await;
        let returned = Utc::now();

        let next = queue.get(id).await.unwrap().next_attempt_at.unwrap();
        let retry_after = chrono::Duration::seconds(30);
        let upload_time = chrono::Duration::from_std(upload_time).unwrap();
        assert!(next >= started + upload_time + retry_after);
        assert!(next <= returned + retry_after);
    }

    #[tokio::test]
    async fn test_unauthorized_is_permanent_until_manual_retry() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::with_script(vec![Err(
            UploadError::Unauthorized,
        )]));
        let queue = online_queue(client.clone()).await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        let mut events = queue.subscribe();
        let now = Utc::now();
        queue.process_at(now).await;

        assert_eq!(
            status_changes(&mut events),
            vec![
                UploadStatus::Uploading,
                UploadStatus::Failed,
                UploadStatus::PermanentlyFailed
            ]
        );
        let item = queue.get(id).await.unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error, Some(UploadError::Unauthorized));

        let later = queue.process_at(now + chrono::Duration::hours(1)).await;
        assert_eq!(later.attempted, 0);
        assert_eq!(client.calls(), 1);

        queue.retry(id).await.unwrap();
        assert_eq!(queue.process().await.completed, 1);
    }

    #[tokio::test]
    async fn test_permanently_failed_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let failures = (0..5)
            .map(|_| {
                Err(UploadError::ServerError {
                    status: 503,
                    retry_after_ms: None,
                })
            })
            .collect();
        let client = Arc::new(ScriptedUploadClient::with_script(failures));
        let queue = online_queue(client.clone()).await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        let mut now = Utc::now();
        let mut previous_delay = chrono::Duration::zero();
        for attempt in 1..=4u32 {
            queue.process_at(now).await;
            let item = queue.get(id).await.unwrap();
            assert_eq!(item.status, UploadStatus::Failed);
            assert_eq!(item.retry_count, attempt);

            let next = item.next_attempt_at.unwrap();
            assert!(next - now >= previous_delay);
            previous_delay = next - now;
            now = next;
        }

        let summary = queue.process_at(now).await;
        assert_eq!(summary.permanently_failed, 1);
        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::PermanentlyFailed);
        assert_eq!(item.retry_count, 5);
        assert_eq!(item.next_attempt_at, None);

        assert_eq!(queue.process_at(now + chrono::Duration::days(1)).await.attempted, 0);
        assert_eq!(client.calls(), 5);
    }

    #[tokio::test]
    async fn test_offline_pauses_without_touching_items() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::new());
        let network = NetworkMonitor::new(NetworkStatus::offline());
        let queue = open(
            client.clone(),
            network.clone(),
            Arc::new(MemoryQueueStore::new()),
            &config(),
        )
        .await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        assert_eq!(queue.process().await.attempted, 0);
        assert_eq!(queue.get(id).await.unwrap().status, UploadStatus::Pending);
        assert_eq!(client.calls(), 0);

        network.set(NetworkStatus {
            is_connected: true,
            is_internet_reachable: false,
            connection_type: ConnectionType::Wifi,
        });
        assert_eq!(queue.process().await.attempted, 0);

        network.set(NetworkStatus::online(ConnectionType::Wifi));
        assert_eq!(queue.process().await.completed, 1);
    }

    #[tokio::test]
    async fn test_cancel_returns_item_to_pending() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::new().with_delay(Duration::from_secs(30)));
        let queue = online_queue(client).await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        let (summary, cancelled) = tokio::join!(queue.process(), async {
            while queue.get(id).await.map(|item| item.status) != Some(UploadStatus::Uploading) {
                tokio::task::yield_now().await;
            }
            queue.cancel_upload(id).await
        });

        cancelled.unwrap();
        assert!(summary.cancelled);
        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.is_none());

        assert!(matches!(
            queue.cancel_upload(id).await,
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_recovers_interrupted_items() {
        let dir = TempDir::new().unwrap();
        let mut uploading = QueuedCapture::new(capture(&dir, "a").await, Utc::now());
        uploading.status = UploadStatus::Uploading;
        let mut processing = QueuedCapture::new(capture(&dir, "b").await, Utc::now());
        processing.status = UploadStatus::Processing;
        let store = Arc::new(MemoryQueueStore::with_items(vec![uploading, processing]));

        let queue = open(
            Arc::new(ScriptedUploadClient::new()),
            NetworkMonitor::always_online(),
            store.clone(),
            &config(),
        )
        .await;

        let statuses: Vec<_> = queue.snapshot().await.iter().map(|i| i.status).collect();
        assert_eq!(statuses, vec![UploadStatus::Pending, UploadStatus::Completed]);
        let persisted: Vec<_> = store.items().await.iter().map(|i| i.status).collect();
        assert_eq!(persisted, statuses);
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue").join("uploads.cbor");
        let client = Arc::new(ScriptedUploadClient::with_script(vec![Err(
            UploadError::Timeout,
        )]));

        let first = capture(&dir, "a").await;
        let second = capture(&dir, "b").await;
        let ids = vec![first.id(), second.id()];
        {
            let queue = open(
                client.clone(),
                NetworkMonitor::new(NetworkStatus::offline()),
                Arc::new(FileQueueStore::new(&path)),
                &config(),
            )
            .await;
            queue.enqueue(first.clone()).await.unwrap();
            queue.enqueue(second).await.unwrap();
            queue.network().set(NetworkStatus::online(ConnectionType::Wifi));
            queue.cancel_upload(ids[0]).await.unwrap_err();
            let summary = queue.process_at(Utc::now()).await;
            assert_eq!(summary.retry_scheduled, 1);
        }

        let reopened = open(
            client,
            NetworkMonitor::always_online(),
            Arc::new(FileQueueStore::new(&path)),
            &config(),
        )
        .await;
        let items = reopened.snapshot().await;
        assert_eq!(items.iter().map(QueuedCapture::id).collect::<Vec<_>>(), ids);
        assert_eq!(items[0].status, UploadStatus::Failed);
        assert_eq!(items[0].last_error, Some(UploadError::Timeout));
        assert_eq!(items[0].capture, first);
        assert_eq!(items[1].status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_photo_cleanup_after_upload() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            cleanup_after_upload: true,
            ..config()
        };
        let store = Arc::new(MemoryQueueStore::new());
        let queue = open(
            Arc::new(ScriptedUploadClient::new()),
            NetworkMonitor::always_online(),
            store.clone(),
            &config,
        )
        .await;
        let capture = capture(&dir, "a").await;
        let id = capture.id();
        let photo = capture.photo_path().to_path_buf();
        assert!(!capture.compressed_depth_map().is_empty());
        queue.enqueue(capture).await.unwrap();

        queue.process().await;

        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::Completed);
        assert!(item.capture.compressed_depth_map().is_empty());
        let stored = store.items().await;
        assert!(stored[0].capture.compressed_depth_map().is_empty());
        for _ in 0..100 {
            if !photo.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!photo.exists());
    }

    #[tokio::test]
    async fn test_queue_management() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedUploadClient::with_script(vec![
            Ok(RemoteStatus::Completed),
            Err(UploadError::PayloadTooLarge),
        ]));
        let queue = online_queue(client).await;

        let done = capture(&dir, "done").await;
        let rejected = capture(&dir, "rejected").await;
        let waiting = capture(&dir, "waiting").await;
        let (rejected_id, waiting_id) = (rejected.id(), waiting.id());

        queue.enqueue(done.clone()).await.unwrap();
        assert!(matches!(
            queue.enqueue(done).await,
            Err(QueueError::Duplicate(_))
        ));
        queue.enqueue(rejected).await.unwrap();
        queue.process().await;
        queue.enqueue(waiting).await.unwrap();

        assert_eq!(
            queue.stats().await,
            QueueStats {
                pending: 1,
                completed: 1,
                permanently_failed: 1,
                ..QueueStats::default()
            }
        );
        assert!(matches!(
            queue.retry(waiting_id).await,
            Err(QueueError::InvalidState { .. })
        ));

        assert_eq!(queue.clear_completed().await.unwrap(), 1);
        assert_eq!(queue.remove(waiting_id).await.unwrap().id(), waiting_id);
        assert!(matches!(
            queue.remove(waiting_id).await,
            Err(QueueError::NotFound(_))
        ));

        assert_eq!(queue.retry_all_failed().await.unwrap(), 1);
        assert_eq!(queue.get(rejected_id).await.unwrap().status, UploadStatus::Pending);
        assert_eq!(queue.clear_permanently_failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_uploads_after_enqueue() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(online_queue(Arc::new(ScriptedUploadClient::new())).await);
        let mut events = queue.subscribe();

        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.run().await })
        };

        let capture = capture(&dir, "a").await;
        let id = capture.id();
        queue.enqueue(capture).await.unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(QueueEvent::StatusChanged {
                        id: event_id,
                        status: UploadStatus::Completed,
                    }) if event_id == id => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await;

        worker.abort();
        assert!(completed.is_ok());
    }
}
