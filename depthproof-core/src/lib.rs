//! DepthProof Core - trusted photo + depth capture pipeline
//!
//! This crate turns a camera and a depth sensor into verifiable captures:
//! a photo and a depth frame taken as one moment, bound to a hardware-attested
//! device key, and delivered to the backend through a durable upload queue.
//!
//! # Components
//!
//! - [`DeviceKeyManager`]: generate-once, persisted hardware key id
//! - [`AttestationController`]: challenge-response attestation and registration
//! - [`CaptureOrchestrator`]: synchronized photo/depth/location acquisition
//! - [`AssertionBinder`]: signs capture metadata with the attested key
//! - [`CaptureProcessor`]: photo hashing, depth compression, metadata
//! - [`UploadQueue`]: network-gated, retrying, single-consumer uploads
//!
//! Attestation and assertion failures are recorded and never block a capture;
//! such captures upload as unverified.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use depthproof_core::{
//!     AssertionBinder, AttestationController, CaptureOrchestrator, CaptureProcessor,
//!     DeviceKeyManager, MemoryKeyStore, MemoryQueueStore, MockAttestationProvider,
//!     MockCamera, MockChallengeService, MockDepthSensor, NetworkMonitor, PipelineConfig,
//!     ScriptedUploadClient, TrustedCapturePipeline, UploadQueue,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::from_env();
//! let provider = Arc::new(MockAttestationProvider::new());
//! let keystore = Arc::new(MemoryKeyStore::new());
//!
//! let keys = Arc::new(DeviceKeyManager::new(
//!     provider.clone(),
//!     keystore.clone(),
//!     &config.backend_host(),
//!     config.key_generation_timeout,
//! ));
//! let attestation = Arc::new(AttestationController::new(
//!     keys,
//!     provider.clone(),
//!     Arc::new(MockChallengeService::new()),
//!     keystore,
//!     &config,
//! ));
//! attestation.spawn();
//!
//! let orchestrator = Arc::new(CaptureOrchestrator::new(
//!     Arc::new(MockDepthSensor::new(256, 192)),
//!     None,
//!     &config,
//! ));
//! orchestrator.bind_camera(Arc::new(MockCamera::new("photo.jpg", 4032, 3024))).await;
//! orchestrator.start_depth().await?;
//!
//! let queue = Arc::new(
//!     UploadQueue::open(
//!         Arc::new(MemoryQueueStore::new()),
//!         Arc::new(ScriptedUploadClient::new()),
//!         NetworkMonitor::always_online(),
//!         &config,
//!     )
//!     .await?,
//! );
//!
//! let pipeline = TrustedCapturePipeline::new(
//!     orchestrator,
//!     Arc::new(AssertionBinder::new(attestation, provider, config.attestation_timeout)),
//!     CaptureProcessor::new(&config),
//!     queue.clone(),
//! );
//! let capture = pipeline.capture_and_enqueue().await?;
//! println!("queued {} (verified: {})", capture.id(), capture.assertion().is_some());
//! queue.process().await;
//! # Ok(())
//! # }
//! ```

pub mod assertion;
pub mod attestation;
pub mod capture;
pub mod config;
pub mod device_key;
pub mod digest;
pub mod error;
#[cfg(feature = "http")]
pub mod http_client;
pub mod keystore;
pub mod pipeline;
pub mod processor;
pub mod upload;

// Re-export main types for convenience
pub use assertion::{AssertionBinder, CaptureAssertion};
pub use attestation::{
    AttestationController, AttestationProvider, AttestationReadiness, AttestationSession,
    AttestationStatus, Challenge, ChallengeRetryPolicy, ChallengeService, DeviceRegistration,
    MockAttestationProvider, MockChallengeService, RegisteredDevice,
};
pub use capture::{
    CameraHandle, CaptureLocation, CaptureOrchestrator, CaptureState, CapturedPhoto,
    DepthCaptureProvider, DepthFrame, Dimensions, LocationPolicy, LocationProvider, MockCamera,
    MockDepthSensor, MockLocationProvider, PhotoExif, RawCapture,
};
pub use config::{PipelineConfig, DEFAULT_API_URL, DEFAULT_SYNC_WINDOW_MS};
pub use device_key::{DeviceKey, DeviceKeyManager, KeyStatus};
pub use error::{
    AssertionFailure, AttestationError, CaptureError, KeyError, LocationError, NotReadyReason,
    PipelineError, ProcessingError, ProviderError, QueueError, SensorError, ServiceError,
    StorageError, UploadError,
};
pub use keystore::{scoped_id, FileKeyStore, MemoryKeyStore, SecureKeyStore};
pub use pipeline::TrustedCapturePipeline;
pub use processor::{
    CaptureMetadata, CaptureProcessor, CaptureStatus, PreparedCapture, ProcessedCapture,
};
pub use upload::{
    ConnectionType, FileQueueStore, MemoryQueueStore, NetworkMonitor, NetworkStatus,
    ProcessSummary, QueueEvent, QueueStats, QueueStore, QueuedCapture, RemoteStatus, RetryPolicy,
    ScriptedUploadClient, UploadClient, UploadProgress, UploadQueue, UploadReceipt, UploadStatus,
};

// Network-dependent exports
#[cfg(feature = "http")]
pub use attestation::HttpChallengeService;
#[cfg(feature = "http")]
pub use upload::HttpUploadClient;

// Development attestation without a secure element
#[cfg(feature = "software-attestation")]
pub use attestation::{verify_software_assertion, SoftwareAttestationProvider};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Full path: attest, capture, bind, process, enqueue, upload.
    #[tokio::test]
    async fn test_attested_capture_uploads_with_assertion() {
        let dir = TempDir::new().unwrap();
        let photo = dir.path().join("photo.jpg");
        tokio::fs::write(&photo, b"jpeg").await.unwrap();

        let config = PipelineConfig {
            inter_item_delay: std::time::Duration::ZERO,
            ..PipelineConfig::default()
        };
        let provider = Arc::new(MockAttestationProvider::new());
        let keystore = Arc::new(MemoryKeyStore::new());
        let keys = Arc::new(DeviceKeyManager::new(
            provider.clone(),
            keystore.clone(),
            &config.backend_host(),
            config.key_generation_timeout,
        ));
        let attestation = Arc::new(AttestationController::new(
            keys,
            provider.clone(),
            Arc::new(MockChallengeService::new()),
            keystore,
            &config,
        ));
        attestation.ensure_attested().await.unwrap();

        let orchestrator = Arc::new(CaptureOrchestrator::new(
            Arc::new(MockDepthSensor::new(8, 6)),
            None,
            &config,
        ));
        orchestrator
            .bind_camera(Arc::new(MockCamera::new(&photo, 4032, 3024)))
            .await;
        orchestrator.start_depth().await.unwrap();

        let client = Arc::new(ScriptedUploadClient::new());
        let queue = Arc::new(
            UploadQueue::open(
                Arc::new(MemoryQueueStore::new()),
                client.clone(),
                NetworkMonitor::always_online(),
                &config,
            )
            .await
            .unwrap(),
        );
        let pipeline = TrustedCapturePipeline::new(
            orchestrator,
            Arc::new(AssertionBinder::new(
                attestation,
                provider,
                config.attestation_timeout,
            )),
            CaptureProcessor::new(&config),
            queue.clone(),
        );

        let capture = pipeline.capture_and_enqueue().await.unwrap();
        let assertion = capture.assertion().expect("attested capture carries an assertion");
        assert_eq!(
            assertion.assertion,
            MockAttestationProvider::expected_assertion("mock-key-1", &assertion.client_data_hash)
        );

        assert_eq!(queue.process().await.completed, 1);
        assert_eq!(client.uploaded().await, vec![capture.id()]);
    }
}
