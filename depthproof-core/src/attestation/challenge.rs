//! Backend challenge/registration contract and its retry schedule.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AttestationError, ServiceError};

/// One-time attestation challenge issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Base64 challenge exactly as issued.
    pub challenge: String,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Raw challenge bytes, the encoding the attestation provider signs over.
    pub fn decode(&self) -> Result<Vec<u8>, AttestationError> {
        BASE64
            .decode(self.challenge.trim())
            .map_err(|e| AttestationError::InvalidChallenge(e.to_string()))
    }
}

/// `POST /devices/register` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub platform: String,
    pub model: String,
    pub has_depth_sensor: bool,
    pub attestation: AttestationPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationPayload {
    pub key_id: String,
    /// Base64 attestation object.
    pub attestation_object: String,
    /// The challenge the object was produced over, as issued.
    pub challenge: String,
}

/// `POST /devices/register` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    pub device_id: String,
    pub attestation_level: String,
}

/// Unauthenticated backend endpoints used during attestation.
#[async_trait]
pub trait ChallengeService: Send + Sync {
    /// `GET /devices/challenge`
    async fn fetch_challenge(&self) -> Result<Challenge, ServiceError>;

    /// `POST /devices/register`
    async fn register_device(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<RegisteredDevice, ServiceError>;
}

/// Retry schedule for transient challenge fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl Default for ChallengeRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl ChallengeRetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(self.multiplier.saturating_pow(retry))
    }

    pub fn backoff(&self) -> ChallengeBackoff {
        ChallengeBackoff {
            policy: *self,
            retries: 0,
        }
    }
}

/// Deterministic exponential schedule with a hard retry count, for
/// [`backoff::future::retry_notify`].
#[derive(Debug, Clone)]
pub struct ChallengeBackoff {
    policy: ChallengeRetryPolicy,
    retries: u32,
}

impl backoff::backoff::Backoff for ChallengeBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for(self.retries);
        self.retries += 1;
        Some(delay)
    }
}

#[cfg(feature = "http")]
pub use http::HttpChallengeService;

#[cfg(feature = "http")]
mod http {
    use async_trait::async_trait;
    use reqwest::Client;
    use serde::Deserialize;
    use std::time::Instant;
    use tracing::{debug, instrument, warn};

    use super::{Challenge, ChallengeService, DeviceRegistration, RegisteredDevice};
    use crate::error::ServiceError;
    use crate::http_client::{build_client, is_transient_error};

    #[derive(Debug, Deserialize)]
    struct ChallengeResponse {
        challenge: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    }

    /// reqwest-backed [`ChallengeService`].
    pub struct HttpChallengeService {
        client: Client,
        base_url: String,
    }

    impl HttpChallengeService {
        pub fn new(
            base_url: impl Into<String>,
            timeout: std::time::Duration,
            allow_insecure_http: bool,
        ) -> Result<Self, ServiceError> {
            let client = build_client(timeout, allow_insecure_http).map_err(|e| {
                ServiceError::Network(format!("Failed to create HTTP client: {e}"))
            })?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }

        async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let message = response.text().await.unwrap_or_default();
            Err(ServiceError::Status {
                status: status.as_u16(),
                message: message.chars().take(256).collect(),
            })
        }
    }

    fn classify(error: reqwest::Error) -> ServiceError {
        if error.is_timeout() {
            ServiceError::Timeout
        } else if is_transient_error(&error) {
            ServiceError::Network(error.to_string())
        } else {
            ServiceError::InvalidResponse(error.to_string())
        }
    }

    #[async_trait]
    impl ChallengeService for HttpChallengeService {
        #[instrument(level = "debug", skip(self), fields(base_url = %self.base_url))]
        async fn fetch_challenge(&self) -> Result<Challenge, ServiceError> {
            let start = Instant::now();
            let url = format!("{}/devices/challenge", self.base_url);

            let response = self.client.get(&url).send().await.map_err(|e| {
                warn!(error = %e, latency_ms = start.elapsed().as_millis() as u64, "Challenge request failed");
                classify(e)
            })?;
            let body: ChallengeResponse = Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

            debug!(
                latency_ms = start.elapsed().as_millis() as u64,
                expires_at = %body.expires_at,
                "Challenge received"
            );
            Ok(Challenge {
                challenge: body.challenge,
                expires_at: body.expires_at,
            })
        }

        #[instrument(level = "debug", skip_all, fields(key_id = %registration.attestation.key_id))]
        async fn register_device(
            &self,
            registration: &DeviceRegistration,
        ) -> Result<RegisteredDevice, ServiceError> {
            let url = format!("{}/devices/register", self.base_url);

            let response = self
                .client
                .post(&url)
                .json(registration)
                .send()
                .await
                .map_err(classify)?;
            Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn test_default_schedule_is_1_2_4_seconds() {
        let mut backoff = ChallengeRetryPolicy::default().backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_challenge_expiry_and_decode() {
        let now = Utc::now();
        let challenge = Challenge {
            challenge: BASE64.encode(b"nonce"),
            expires_at: now + chrono::Duration::seconds(60),
        };
        assert!(challenge.is_valid_at(now));
        assert!(!challenge.is_valid_at(now + chrono::Duration::seconds(61)));
        assert_eq!(challenge.decode().unwrap(), b"nonce");

        let bad = Challenge {
            challenge: "***".into(),
            expires_at: now,
        };
        assert!(matches!(
            bad.decode(),
            Err(AttestationError::InvalidChallenge(_))
        ));
    }

    #[test]
    fn test_registration_wire_format() {
        let registration = DeviceRegistration {
            platform: "ios".into(),
            model: "iPhone15,3".into(),
            has_depth_sensor: true,
            attestation: AttestationPayload {
                key_id: "k1".into(),
                attestation_object: "b2JqZWN0".into(),
                challenge: "bm9uY2U=".into(),
            },
        };
        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["hasDepthSensor"], true);
        assert_eq!(json["attestation"]["keyId"], "k1");
        assert_eq!(json["attestation"]["attestationObject"], "b2JqZWN0");
    }
}
