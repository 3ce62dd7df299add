//! Scripted upload transport for tests and simulators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{RemoteStatus, UploadClient, UploadProgress, UploadReceipt};
use crate::error::UploadError;
use crate::processor::ProcessedCapture;

/// Replays a queue of responses, then accepts everything as `completed`.
///
/// Tracks how many uploads overlap so tests can assert serialization.
#[derive(Default)]
pub struct ScriptedUploadClient {
    script: Mutex<VecDeque<Result<RemoteStatus, UploadError>>>,
    delay: Duration,
    uploaded: Mutex<Vec<Uuid>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedUploadClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Result<RemoteStatus, UploadError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Hold every upload for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn push(&self, response: Result<RemoteStatus, UploadError>) {
        self.script.lock().await.push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Ids of captures the client accepted, in order.
    pub async fn uploaded(&self) -> Vec<Uuid> {
        self.uploaded.lock().await.clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadClient for ScriptedUploadClient {
    async fn upload(
        &self,
        capture: &ProcessedCapture,
        progress: &(dyn Fn(UploadProgress) + Send + Sync),
    ) -> Result<UploadReceipt, UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let total = capture.compressed_depth_map().len() as u64;
        progress(UploadProgress { sent: 0, total });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let response = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(RemoteStatus::Completed));
        let status = response?;

        progress(UploadProgress { sent: total, total });
        self.uploaded.lock().await.push(capture.id());
        Ok(UploadReceipt {
            capture_id: format!("remote-{}", capture.id()),
            verification_url: format!("https://verify.depthproof.dev/c/{}", capture.id()),
            status,
        })
    }
}
