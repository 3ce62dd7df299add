use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::future::retry_notify;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use super::{
    AttestationPayload, AttestationProvider, AttestationReadiness, Challenge,
    ChallengeRetryPolicy, ChallengeService, DeviceRegistration,
};
use crate::config::PipelineConfig;
use crate::device_key::DeviceKeyManager;
use crate::digest::base64_bytes;
use crate::error::{AttestationError, ServiceError};
use crate::keystore::{scoped_id, SecureKeyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationStatus {
    Idle,
    FetchingChallenge,
    Attesting,
    Attested,
    Failed,
}

/// Live attestation state for the current device key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationSession {
    pub status: AttestationStatus,
    pub key_id: Option<String>,
    /// Cached challenge, reused until it expires.
    pub challenge: Option<Challenge>,
    pub attestation_object: Option<Vec<u8>>,
    pub device_id: Option<String>,
    pub attestation_level: Option<String>,
    /// Manual retries performed so far.
    pub retry_attempt: u32,
    pub last_error: Option<AttestationError>,
}

impl Default for AttestationSession {
    fn default() -> Self {
        Self {
            status: AttestationStatus::Idle,
            key_id: None,
            challenge: None,
            attestation_object: None,
            device_id: None,
            attestation_level: None,
            retry_attempt: 0,
            last_error: None,
        }
    }
}

impl AttestationSession {
    pub fn is_ready(&self) -> bool {
        self.status == AttestationStatus::Attested && self.key_id.is_some()
    }
}

/// What survives a restart once a key is attested.
#[derive(Debug, Serialize, Deserialize)]
struct AttestationRecord {
    key_id: String,
    device_id: String,
    attestation_level: String,
    #[serde(with = "base64_bytes")]
    attestation_object: Vec<u8>,
    attested_at: DateTime<Utc>,
}

/// Drives challenge-response attestation of the device key.
///
/// Attestation is one-time per key: once `Attested`, every call
/// short-circuits. A failure parks the session in `Failed` until
/// [`retry`](Self::retry) is called explicitly, so a device that failed a
/// security check is never re-attested behind the user's back.
pub struct AttestationController {
    keys: Arc<DeviceKeyManager>,
    provider: Arc<dyn AttestationProvider>,
    service: Arc<dyn ChallengeService>,
    store: Arc<dyn SecureKeyStore>,
    record_id: String,
    platform: String,
    model: String,
    has_depth_sensor: bool,
    timeout: Duration,
    retry_policy: ChallengeRetryPolicy,
    session: watch::Sender<AttestationSession>,
    flight: Mutex<()>,
}

impl AttestationController {
    pub fn new(
        keys: Arc<DeviceKeyManager>,
        provider: Arc<dyn AttestationProvider>,
        service: Arc<dyn ChallengeService>,
        store: Arc<dyn SecureKeyStore>,
        config: &PipelineConfig,
    ) -> Self {
        let (session, _) = watch::channel(AttestationSession::default());
        Self {
            keys,
            provider,
            service,
            store,
            record_id: scoped_id(&config.backend_host(), "attestation"),
            platform: config.platform.clone(),
            model: config.device_model.clone(),
            has_depth_sensor: config.has_depth_sensor,
            timeout: config.attestation_timeout,
            retry_policy: config.challenge_retry,
            session,
            flight: Mutex::new(()),
        }
    }

    pub fn session(&self) -> AttestationSession {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AttestationSession> {
        self.session.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.session.borrow().is_ready()
    }

    /// Attest the device key unless already attested or parked in `Failed`.
    pub async fn ensure_attested(&self) -> Result<(), AttestationError> {
        let _flight = self.flight.lock().await;

        let current = self.session();
        match current.status {
            AttestationStatus::Attested => return Ok(()),
            AttestationStatus::Failed => {
                debug!("Attestation previously failed, waiting for manual retry");
                return Err(current
                    .last_error
                    .unwrap_or_else(|| AttestationError::Failed("unknown failure".into())));
            }
            _ => {}
        }

        self.attest_locked().await
    }

    /// Manual retry from `Failed`, the only way out of a failed attestation.
    pub async fn retry(&self) -> Result<(), AttestationError> {
        let _flight = self.flight.lock().await;

        if self.session.borrow().status == AttestationStatus::Attested {
            return Ok(());
        }
        self.session.send_modify(|s| s.retry_attempt += 1);
        self.attest_locked().await
    }

    /// Load a persisted attestation for the device key without contacting
    /// the backend. Returns whether the device is attested afterwards.
    pub async fn restore(&self) -> Result<bool, AttestationError> {
        let _flight = self.flight.lock().await;

        if self.is_ready() {
            return Ok(true);
        }
        let key_id = self
            .keys
            .ensure_key()
            .await
            .map_err(|e| self.fail(e.into()))?;
        if !self.restore_locked(&key_id).await {
            self.session.send_modify(|s| s.key_id = Some(key_id));
            return Ok(false);
        }
        Ok(true)
    }

    /// Run [`ensure_attested`](Self::ensure_attested) on a background task.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = controller.ensure_attested().await {
                warn!(error = %e, "Attestation unavailable, device operating unverified");
            }
        })
    }

    #[instrument(level = "info", skip(self))]
    async fn attest_locked(&self) -> Result<(), AttestationError> {
        let start = Instant::now();

        let key_id = match self.keys.ensure_key().await {
            Ok(key_id) => key_id,
            Err(e) => return Err(self.fail(e.into())),
        };

        if self.restore_locked(&key_id).await {
            return Ok(());
        }

        self.session.send_modify(|s| {
            s.status = AttestationStatus::FetchingChallenge;
            s.key_id = Some(key_id.clone());
            s.last_error = None;
        });
        let challenge = match self.obtain_challenge().await {
            Ok(challenge) => challenge,
            Err(e) => return Err(self.fail(e)),
        };

        self.session
            .send_modify(|s| s.status = AttestationStatus::Attesting);
        let challenge_bytes = match challenge.decode() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(e)),
        };
        let attestation_object = match tokio::time::timeout(
            self.timeout,
            self.provider.attest_key(&key_id, &challenge_bytes),
        )
        .await
        {
            Err(_) => return Err(self.fail(AttestationError::Timeout(self.timeout))),
            Ok(Err(e)) => return Err(self.fail(e.into())),
            Ok(Ok(object)) => object,
        };

        let registration = DeviceRegistration {
            platform: self.platform.clone(),
            model: self.model.clone(),
            has_depth_sensor: self.has_depth_sensor,
            attestation: AttestationPayload {
                key_id: key_id.clone(),
                attestation_object: BASE64.encode(&attestation_object),
                challenge: challenge.challenge.clone(),
            },
        };
        let registered = match self.service.register_device(&registration).await {
            Ok(registered) => registered,
            Err(e) => return Err(self.fail(AttestationError::RegistrationFailed(e))),
        };

        let record = AttestationRecord {
            key_id: key_id.clone(),
            device_id: registered.device_id.clone(),
            attestation_level: registered.attestation_level.clone(),
            attestation_object: attestation_object.clone(),
            attested_at: Utc::now(),
        };
        if let Err(e) = self.save_record(&record).await {
            return Err(self.fail(e));
        }

        info!(
            key_id = %key_id,
            device_id = %registered.device_id,
            attestation_level = %registered.attestation_level,
            latency_ms = start.elapsed().as_millis() as u64,
            "Device attested"
        );
        self.session.send_modify(|s| {
            s.status = AttestationStatus::Attested;
            s.challenge = None;
            s.attestation_object = Some(attestation_object);
            s.device_id = Some(registered.device_id);
            s.attestation_level = Some(registered.attestation_level);
            s.last_error = None;
        });
        Ok(())
    }

    async fn restore_locked(&self, key_id: &str) -> bool {
        let Some(record) = self.load_record(key_id).await else {
            return false;
        };
        info!(key_id = %key_id, device_id = %record.device_id, "Restored persisted attestation");
        self.session.send_modify(|s| {
            s.status = AttestationStatus::Attested;
            s.key_id = Some(record.key_id);
            s.attestation_object = Some(record.attestation_object);
            s.device_id = Some(record.device_id);
            s.attestation_level = Some(record.attestation_level);
            s.last_error = None;
        });
        true
    }

    /// Reuse the cached challenge while valid, otherwise fetch with retry.
    async fn obtain_challenge(&self) -> Result<Challenge, AttestationError> {
        let cached = self
            .session
            .borrow()
            .challenge
            .clone()
            .filter(|c| c.is_valid_at(Utc::now()));
        if let Some(challenge) = cached {
            debug!(expires_at = %challenge.expires_at, "Reusing cached challenge");
            return Ok(challenge);
        }

        let challenge = retry_notify(
            self.retry_policy.backoff(),
            || async {
                self.service.fetch_challenge().await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            },
            |err: ServiceError, delay: Duration| {
                warn!(
                    error = %err,
                    retry_after_ms = delay.as_millis() as u64,
                    "Challenge fetch failed, retry scheduled"
                );
            },
        )
        .await
        .map_err(AttestationError::ChallengeFailed)?;

        self.session
            .send_modify(|s| s.challenge = Some(challenge.clone()));
        Ok(challenge)
    }

    async fn load_record(&self, key_id: &str) -> Option<AttestationRecord> {
        let bytes = match self.store.get(&self.record_id).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted attestation");
                return None;
            }
        };
        match serde_json::from_slice::<AttestationRecord>(&bytes) {
            Ok(record) if record.key_id == key_id => Some(record),
            Ok(record) => {
                debug!(stored = %record.key_id, current = %key_id, "Persisted attestation belongs to another key");
                None
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable attestation record");
                None
            }
        }
    }

    async fn save_record(&self, record: &AttestationRecord) -> Result<(), AttestationError> {
        let bytes =
            serde_json::to_vec(record).map_err(|e| AttestationError::Storage(e.to_string()))?;
        self.store
            .set(&self.record_id, &bytes)
            .await
            .map_err(|e| AttestationError::Storage(e.to_string()))
    }

    fn fail(&self, err: AttestationError) -> AttestationError {
        if err.is_security_failure() {
            warn!(error = %err, "Device failed security check, manual retry required");
        } else {
            warn!(error = %err, "Attestation failed, device operating unverified");
        }
        self.session.send_modify(|s| {
            s.status = AttestationStatus::Failed;
            s.last_error = Some(err.clone());
        });
        err
    }
}

impl AttestationReadiness for AttestationController {
    fn attested_key_id(&self) -> Option<String> {
        let session = self.session.borrow();
        if session.is_ready() {
            session.key_id.clone()
        } else {
            None
        }
    }
}
