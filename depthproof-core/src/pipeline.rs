//! End-to-end capture path: capture, process, bind, enqueue.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::assertion::AssertionBinder;
use crate::capture::{CaptureOrchestrator, RawCapture};
use crate::error::PipelineError;
use crate::processor::{CaptureProcessor, ProcessedCapture};
use crate::upload::UploadQueue;

/// Wires the per-capture components together.
///
/// Attestation is never awaited here. If the device is not attested yet the
/// binder yields no assertion and the capture is queued unverified.
pub struct TrustedCapturePipeline {
    orchestrator: Arc<CaptureOrchestrator>,
    binder: Arc<AssertionBinder>,
    processor: CaptureProcessor,
    queue: Arc<UploadQueue>,
}

impl TrustedCapturePipeline {
    pub fn new(
        orchestrator: Arc<CaptureOrchestrator>,
        binder: Arc<AssertionBinder>,
        processor: CaptureProcessor,
        queue: Arc<UploadQueue>,
    ) -> Self {
        Self {
            orchestrator,
            binder,
            processor,
            queue,
        }
    }

    pub fn orchestrator(&self) -> &Arc<CaptureOrchestrator> {
        &self.orchestrator
    }

    pub fn binder(&self) -> &Arc<AssertionBinder> {
        &self.binder
    }

    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    /// Take a synchronized capture and queue it for upload.
    pub async fn capture_and_enqueue(&self) -> Result<ProcessedCapture, PipelineError> {
        let raw = self.orchestrator.capture().await?;
        self.submit(raw).await
    }

    /// Process, bind and queue a capture acquired elsewhere.
    #[instrument(level = "info", skip_all, fields(capture_id = %raw.id()))]
    pub async fn submit(&self, raw: RawCapture) -> Result<ProcessedCapture, PipelineError> {
        let prepared = self.processor.prepare(&raw).await?;
        let assertion = self.binder.bind(prepared.metadata()).await;
        let processed = prepared.finish(assertion);

        self.queue.enqueue(processed.clone()).await?;
        info!(
            verified = processed.assertion().is_some(),
            sync_delta_ms = raw.sync_delta_ms(),
            "Capture sealed and queued"
        );
        Ok(processed)
    }
}
