//! Deterministic attestation doubles for tests and simulators.
//! WARNING: Do not use in production - nothing here is hardware-backed!

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use sha3::{Digest, Sha3_256};
use tokio::sync::Mutex;

use super::{
    AttestationProvider, Challenge, ChallengeService, DeviceRegistration, RegisteredDevice,
};
use crate::error::{ProviderError, ServiceError};

/// Failure injected into the next `remaining` calls.
struct FailurePlan {
    error: ProviderError,
    remaining: AtomicUsize,
}

impl FailurePlan {
    fn take(plan: &Option<FailurePlan>) -> Option<ProviderError> {
        let plan = plan.as_ref()?;
        plan.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| plan.error.clone())
    }
}

/// Mock hardware provider with scripted latency and failures.
#[derive(Default)]
pub struct MockAttestationProvider {
    generate_delay: Duration,
    attest_delay: Duration,
    assertion_delay: Duration,
    generate_failure: Option<FailurePlan>,
    attest_failure: Option<FailurePlan>,
    assertion_failure: Option<FailurePlan>,
    generate_calls: AtomicUsize,
    attest_calls: AtomicUsize,
    assertion_calls: AtomicUsize,
}

impl MockAttestationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    pub fn with_attest_delay(mut self, delay: Duration) -> Self {
        self.attest_delay = delay;
        self
    }

    pub fn with_assertion_delay(mut self, delay: Duration) -> Self {
        self.assertion_delay = delay;
        self
    }

    /// Fail the next `times` key generations.
    pub fn failing_generate(mut self, error: ProviderError, times: usize) -> Self {
        self.generate_failure = Some(FailurePlan {
            error,
            remaining: AtomicUsize::new(times),
        });
        self
    }

    /// Fail the next `times` attestations.
    pub fn failing_attest(mut self, error: ProviderError, times: usize) -> Self {
        self.attest_failure = Some(FailurePlan {
            error,
            remaining: AtomicUsize::new(times),
        });
        self
    }

    /// Fail the next `times` assertions.
    pub fn failing_assertion(mut self, error: ProviderError, times: usize) -> Self {
        self.assertion_failure = Some(FailurePlan {
            error,
            remaining: AtomicUsize::new(times),
        });
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn attest_calls(&self) -> usize {
        self.attest_calls.load(Ordering::SeqCst)
    }

    pub fn assertion_calls(&self) -> usize {
        self.assertion_calls.load(Ordering::SeqCst)
    }

    /// The assertion this mock produces for `(key_id, client_data_hash)`.
    pub fn expected_assertion(key_id: &str, client_data_hash: &str) -> Vec<u8> {
        let mut hasher = Sha3_256::new();
        hasher.update(b"mock-assertion");
        hasher.update(key_id.as_bytes());
        hasher.update(client_data_hash.as_bytes());
        hasher.finalize().to_vec()
    }
}

#[async_trait]
impl AttestationProvider for MockAttestationProvider {
    async fn generate_key(&self) -> Result<String, ProviderError> {
        let n = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.generate_delay.is_zero() {
            tokio::time::sleep(self.generate_delay).await;
        }
        if let Some(err) = FailurePlan::take(&self.generate_failure) {
            return Err(err);
        }
        Ok(format!("mock-key-{n}"))
    }

    async fn attest_key(&self, key_id: &str, challenge: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.attest_calls.fetch_add(1, Ordering::SeqCst);
        if !self.attest_delay.is_zero() {
            tokio::time::sleep(self.attest_delay).await;
        }
        if let Some(err) = FailurePlan::take(&self.attest_failure) {
            return Err(err);
        }
        let mut hasher = Sha3_256::new();
        hasher.update(b"mock-attestation");
        hasher.update(key_id.as_bytes());
        hasher.update(challenge);
        Ok(hasher.finalize().to_vec())
    }

    async fn generate_assertion(
        &self,
        key_id: &str,
        client_data_hash: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        self.assertion_calls.fetch_add(1, Ordering::SeqCst);
        if !self.assertion_delay.is_zero() {
            tokio::time::sleep(self.assertion_delay).await;
        }
        if let Some(err) = FailurePlan::take(&self.assertion_failure) {
            return Err(err);
        }
        Ok(Self::expected_assertion(key_id, client_data_hash))
    }
}

/// Mock backend with a scripted queue of challenge responses.
///
/// Once the script is exhausted every fetch returns a fresh challenge valid
/// for five minutes.
pub struct MockChallengeService {
    script: Mutex<VecDeque<Result<Challenge, ServiceError>>>,
    registration: Result<RegisteredDevice, ServiceError>,
    fetch_calls: AtomicUsize,
    register_calls: AtomicUsize,
}

impl Default for MockChallengeService {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            registration: Ok(RegisteredDevice {
                device_id: "mock-device".to_string(),
                attestation_level: "hardware".to_string(),
            }),
            fetch_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
        }
    }
}

impl MockChallengeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Result<Challenge, ServiceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn with_registration(mut self, result: Result<RegisteredDevice, ServiceError>) -> Self {
        self.registration = result;
        self
    }

    /// A challenge valid for `ttl` from now.
    pub fn challenge(nonce: &[u8], ttl: Duration) -> Challenge {
        Challenge {
            challenge: BASE64.encode(nonce),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeService for MockChallengeService {
    async fn fetch_challenge(&self) -> Result<Challenge, ServiceError> {
        let n = self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(Self::challenge(
                format!("mock-challenge-{n}").as_bytes(),
                Duration::from_secs(300),
            )),
        }
    }

    async fn register_device(
        &self,
        _registration: &DeviceRegistration,
    ) -> Result<RegisteredDevice, ServiceError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.registration.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_plan_is_consumed() {
        let provider = MockAttestationProvider::new()
            .failing_generate(ProviderError::Failed("boom".into()), 1);

        assert!(provider.generate_key().await.is_err());
        assert_eq!(provider.generate_key().await.unwrap(), "mock-key-2");
        assert_eq!(provider.generate_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_assertion_is_deterministic() {
        let provider = MockAttestationProvider::new();
        let a = provider.generate_assertion("k", "hash").await.unwrap();
        let b = provider.generate_assertion("k", "hash").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, MockAttestationProvider::expected_assertion("k", "hash"));
    }

    #[tokio::test]
    async fn test_mock_service_script_then_default() {
        let service = MockChallengeService::with_script(vec![Err(ServiceError::Timeout)]);
        assert_eq!(service.fetch_challenge().await, Err(ServiceError::Timeout));
        assert!(service.fetch_challenge().await.is_ok());
        assert_eq!(service.fetch_calls(), 2);
    }
}
