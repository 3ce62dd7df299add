//! Binds capture metadata to the attested device key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::attestation::{AttestationProvider, AttestationReadiness};
use crate::digest::{base64_bytes, sha256_base64};
use crate::error::AssertionFailure;
use crate::processor::CaptureMetadata;

/// Hardware signature over a capture's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureAssertion {
    #[serde(with = "base64_bytes")]
    pub assertion: Vec<u8>,
    /// Base64 SHA-256 of the signed metadata bytes.
    pub client_data_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Produces [`CaptureAssertion`]s when the device is attested.
///
/// `bind` never fails: a capture without an assertion still uploads, flagged
/// unverified by the backend. The reason for the last skipped assertion is
/// kept for diagnostics.
pub struct AssertionBinder {
    readiness: Arc<dyn AttestationReadiness>,
    provider: Arc<dyn AttestationProvider>,
    timeout: Duration,
    last_failure: watch::Sender<Option<AssertionFailure>>,
}

impl AssertionBinder {
    pub fn new(
        readiness: Arc<dyn AttestationReadiness>,
        provider: Arc<dyn AttestationProvider>,
        timeout: Duration,
    ) -> Self {
        let (last_failure, _) = watch::channel(None);
        Self {
            readiness,
            provider,
            timeout,
            last_failure,
        }
    }

    pub fn last_failure(&self) -> Option<AssertionFailure> {
        self.last_failure.borrow().clone()
    }

    #[instrument(level = "debug", skip_all, fields(photo_hash = %metadata.photo_hash))]
    pub async fn bind(&self, metadata: &CaptureMetadata) -> Option<CaptureAssertion> {
        match self.try_bind(metadata).await {
            Ok(assertion) => {
                self.last_failure.send_replace(None);
                Some(assertion)
            }
            Err(failure) => {
                match &failure {
                    AssertionFailure::NotAttested => {
                        debug!("Device not attested, capture will upload unverified")
                    }
                    other => {
                        warn!(error = %other, "Assertion skipped, capture will upload unverified")
                    }
                }
                self.last_failure.send_replace(Some(failure));
                None
            }
        }
    }

    async fn try_bind(
        &self,
        metadata: &CaptureMetadata,
    ) -> Result<CaptureAssertion, AssertionFailure> {
        let key_id = self
            .readiness
            .attested_key_id()
            .ok_or(AssertionFailure::NotAttested)?;

        let bytes = metadata
            .signable_bytes()
            .map_err(|e| AssertionFailure::HashFailed(e.to_string()))?;
        let client_data_hash = sha256_base64(&bytes);

        let assertion = tokio::time::timeout(
            self.timeout,
            self.provider.generate_assertion(&key_id, &client_data_hash),
        )
        .await
        .map_err(|_| {
            AssertionFailure::AssertionFailed(format!("timed out after {:?}", self.timeout))
        })?
        .map_err(|e| AssertionFailure::AssertionFailed(e.to_string()))?;

        info!(key_id = %key_id, client_data_hash = %client_data_hash, "Capture assertion bound");
        Ok(CaptureAssertion {
            assertion,
            client_data_hash,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{AttestationController, MockAttestationProvider, MockChallengeService};
    use crate::capture::Dimensions;
    use crate::config::PipelineConfig;
    use crate::device_key::DeviceKeyManager;
    use crate::error::{AttestationError, KeyError, ProviderError};
    use crate::keystore::MemoryKeyStore;

    struct Fixed(Option<String>);

    impl AttestationReadiness for Fixed {
        fn attested_key_id(&self) -> Option<String> {
            self.0.clone()
        }
    }

    fn metadata() -> CaptureMetadata {
        CaptureMetadata {
            captured_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            device_model: "iPhone15,3".into(),
            photo_hash: "ab".repeat(32),
            depth_map_hash: "cd".repeat(32),
            depth_map_dimensions: Dimensions {
                width: 256,
                height: 192,
            },
            location: None,
            assertion: None,
        }
    }

    fn binder(key: Option<&str>, provider: MockAttestationProvider) -> AssertionBinder {
        AssertionBinder::new(
            Arc::new(Fixed(key.map(str::to_string))),
            Arc::new(provider),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_unattested_device_gets_no_assertion() {
        let binder = binder(None, MockAttestationProvider::new());
        assert_eq!(binder.bind(&metadata()).await, None);
        assert_eq!(binder.last_failure(), Some(AssertionFailure::NotAttested));
    }

    #[tokio::test]
    async fn test_assertion_signs_metadata_hash() {
        let binder = binder(Some("key-1"), MockAttestationProvider::new());
        let metadata = metadata();

        let assertion = binder.bind(&metadata).await.unwrap();

        let expected_hash = sha256_base64(&metadata.signable_bytes().unwrap());
        assert_eq!(assertion.client_data_hash, expected_hash);
        assert_eq!(
            assertion.assertion,
            MockAttestationProvider::expected_assertion("key-1", &expected_hash)
        );
        assert_eq!(binder.last_failure(), None);
    }

    #[tokio::test]
    async fn test_provider_failure_is_recorded_not_raised() {
        let binder = binder(
            Some("key-1"),
            MockAttestationProvider::new()
                .failing_assertion(ProviderError::Failed("key invalidated".into()), 1),
        );

        assert_eq!(binder.bind(&metadata()).await, None);
        assert!(matches!(
            binder.last_failure(),
            Some(AssertionFailure::AssertionFailed(_))
        ));

        // The next capture binds normally.
        assert!(binder.bind(&metadata()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_provider_times_out() {
        let provider = MockAttestationProvider::new().with_assertion_delay(Duration::from_secs(60));
        let binder = binder(Some("key-1"), provider);

        assert_eq!(binder.bind(&metadata()).await, None);
        match binder.last_failure() {
            Some(AssertionFailure::AssertionFailed(reason)) => {
                assert!(reason.starts_with("timed out"), "{reason}")
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_timeout_yields_unverified_capture() {
        let config = PipelineConfig {
            api_url: "https://api.test".into(),
            ..PipelineConfig::default()
        };
        let provider =
            Arc::new(MockAttestationProvider::new().with_generate_delay(Duration::from_secs(60)));
        let store = Arc::new(MemoryKeyStore::new());
        let keys = Arc::new(DeviceKeyManager::new(
            provider.clone(),
            store.clone(),
            &config.backend_host(),
            config.key_generation_timeout,
        ));
        let controller = Arc::new(AttestationController::new(
            keys,
            provider.clone(),
            Arc::new(MockChallengeService::new()),
            store,
            &config,
        ));

        assert!(matches!(
            controller.ensure_attested().await,
            Err(AttestationError::KeyUnavailable(KeyError::Timeout(_)))
        ));

        let binder = AssertionBinder::new(controller, provider.clone(), config.attestation_timeout);
        assert_eq!(binder.bind(&metadata()).await, None);
        assert_eq!(binder.last_failure(), Some(AssertionFailure::NotAttested));
        assert_eq!(provider.assertion_calls(), 0);
    }

    #[test]
    fn test_assertion_wire_format() {
        let assertion = CaptureAssertion {
            assertion: vec![0xde, 0xad],
            client_data_hash: "aGFzaA==".into(),
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
        };
        let json = serde_json::to_value(&assertion).unwrap();
        assert_eq!(json["assertion"], "3q0=");
        assert_eq!(json["clientDataHash"], "aGFzaA==");
    }
}
