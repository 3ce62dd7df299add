//! Device key lifecycle: generate-or-reuse, persist, invalidate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::attestation::AttestationProvider;
use crate::error::KeyError;
use crate::keystore::{scoped_id, SecureKeyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Checking,
    Generating,
    Ready,
    Failed,
}

/// Observable device key state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKey {
    pub key_id: Option<String>,
    pub status: KeyStatus,
}

/// Owns the device's hardware key id.
///
/// Generation is single-flight: concurrent [`ensure_key`](Self::ensure_key)
/// callers queue on one guard, and all but the first find the key already
/// `Ready`.
pub struct DeviceKeyManager {
    provider: Arc<dyn AttestationProvider>,
    store: Arc<dyn SecureKeyStore>,
    storage_id: String,
    timeout: Duration,
    state: watch::Sender<DeviceKey>,
    flight: Mutex<()>,
}

impl DeviceKeyManager {
    /// `backend_host` scopes the persisted key id to one environment.
    pub fn new(
        provider: Arc<dyn AttestationProvider>,
        store: Arc<dyn SecureKeyStore>,
        backend_host: &str,
        timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(DeviceKey {
            key_id: None,
            status: KeyStatus::Checking,
        });
        Self {
            provider,
            store,
            storage_id: scoped_id(backend_host, "device_key_id"),
            timeout,
            state,
            flight: Mutex::new(()),
        }
    }

    pub fn current(&self) -> DeviceKey {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceKey> {
        self.state.subscribe()
    }

    /// Return the persisted key id, generating one on first use.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_key(&self) -> Result<String, KeyError> {
        let _flight = self.flight.lock().await;

        if let DeviceKey {
            key_id: Some(key_id),
            status: KeyStatus::Ready,
        } = self.current()
        {
            return Ok(key_id);
        }

        self.set(None, KeyStatus::Checking);
        match self.store.get(&self.storage_id).await {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(key_id) if !key_id.trim().is_empty() => {
                    debug!(key_id = %key_id, "Reusing persisted device key");
                    self.set(Some(key_id.clone()), KeyStatus::Ready);
                    return Ok(key_id);
                }
                _ => {
                    warn!("Persisted device key id is unreadable, regenerating");
                    if let Err(e) = self.store.delete(&self.storage_id).await {
                        return Err(self.fail(KeyError::StorageFailed(e.to_string())));
                    }
                }
            },
            Ok(None) => debug!("No persisted device key"),
            Err(e) => return Err(self.fail(KeyError::StorageFailed(e.to_string()))),
        }

        self.generate_locked().await
    }

    /// Discard the persisted key and generate a fresh one.
    ///
    /// Only for a previously `Ready` key that later turned out unreadable.
    #[instrument(level = "info", skip(self))]
    pub async fn regenerate(&self) -> Result<String, KeyError> {
        let _flight = self.flight.lock().await;

        self.store
            .delete(&self.storage_id)
            .await
            .map_err(|e| self.fail(KeyError::StorageFailed(e.to_string())))?;
        self.set(None, KeyStatus::Checking);

        self.generate_locked().await
    }

    async fn generate_locked(&self) -> Result<String, KeyError> {
        self.set(None, KeyStatus::Generating);

        let key_id = match tokio::time::timeout(self.timeout, self.provider.generate_key()).await {
            Err(_) => return Err(self.fail(KeyError::Timeout(self.timeout))),
            Ok(Err(e)) => return Err(self.fail(e.into())),
            Ok(Ok(key_id)) if key_id.trim().is_empty() => {
                return Err(self.fail(KeyError::GenerationFailed(
                    "provider returned an empty key id".into(),
                )))
            }
            Ok(Ok(key_id)) => key_id,
        };

        if let Err(e) = self.store.set(&self.storage_id, key_id.as_bytes()).await {
            return Err(self.fail(KeyError::StorageFailed(e.to_string())));
        }

        info!(key_id = %key_id, "Device key generated");
        self.set(Some(key_id.clone()), KeyStatus::Ready);
        Ok(key_id)
    }

    fn set(&self, key_id: Option<String>, status: KeyStatus) {
        self.state.send_replace(DeviceKey { key_id, status });
    }

    fn fail(&self, err: KeyError) -> KeyError {
        warn!(error = %err, "Device key unavailable, continuing unverified");
        self.set(None, KeyStatus::Failed);
        err
    }
}
