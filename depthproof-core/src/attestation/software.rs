//! Software attestation provider backed by ML-DSA-65 (FIPS 204).
//!
//! For development devices and the CLI, where no secure element is available.
//! Keys are persisted in a [`SecureKeyStore`]; the backend sees attestation
//! format `mldsa65-software` and grades the device accordingly.

use std::sync::Arc;

use async_trait::async_trait;
use pqcrypto_mldsa::mldsa65;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::AttestationProvider;
use crate::error::ProviderError;
use crate::keystore::{scoped_id, SecureKeyStore};

const ATTEST_DOMAIN: &[u8] = b"depthproof-attest-v1";
const ASSERT_DOMAIN: &[u8] = b"depthproof-assert-v1";

/// Persisted keypair. Secret bytes are wiped when the record is dropped.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyRecord {
    public_key: Vec<u8>,
    secret_key: Vec<u8>,
}

/// Attestation object produced by the software provider (CBOR encoded).
#[derive(Debug, Serialize, Deserialize)]
struct SoftwareAttestation {
    format: String,
    key_id: String,
    public_key: Vec<u8>,
    signature: Vec<u8>,
}

pub struct SoftwareAttestationProvider {
    store: Arc<dyn SecureKeyStore>,
    namespace: String,
}

impl SoftwareAttestationProvider {
    /// `namespace` scopes persisted keys, normally the backend host.
    pub fn new(store: Arc<dyn SecureKeyStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn record_id(&self, key_id: &str) -> String {
        scoped_id(&self.namespace, &format!("software_key/{key_id}"))
    }

    async fn load(&self, key_id: &str) -> Result<(KeyRecord, mldsa65::SecretKey), ProviderError> {
        let bytes = self
            .store
            .get(&self.record_id(key_id))
            .await
            .map_err(|e| ProviderError::Failed(format!("key store read failed: {e}")))?
            .ok_or_else(|| ProviderError::KeyNotFound(key_id.to_string()))?;

        let record: KeyRecord = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| ProviderError::Failed(format!("corrupted key record: {e}")))?;
        let secret = mldsa65::SecretKey::from_bytes(&record.secret_key)
            .map_err(|_| ProviderError::Failed("invalid secret key".into()))?;
        Ok((record, secret))
    }

    /// Public key for `key_id`, for verifiers.
    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, ProviderError> {
        let (record, _) = self.load(key_id).await?;
        Ok(record.public_key.clone())
    }
}

fn key_id_for(public_key: &[u8]) -> String {
    hex::encode(&Sha3_256::digest(public_key)[..16])
}

fn signing_input(domain: &[u8], key_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(domain.len() + key_id.len() + payload.len());
    message.extend_from_slice(domain);
    message.extend_from_slice(key_id.as_bytes());
    message.extend_from_slice(payload);
    message
}

#[async_trait]
impl AttestationProvider for SoftwareAttestationProvider {
    async fn generate_key(&self) -> Result<String, ProviderError> {
        let (public_key, secret_key) = mldsa65::keypair();
        let key_id = key_id_for(public_key.as_bytes());

        let record = KeyRecord {
            public_key: public_key.as_bytes().to_vec(),
            secret_key: secret_key.as_bytes().to_vec(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&record, &mut bytes)
            .map_err(|e| ProviderError::Failed(format!("key encoding failed: {e}")))?;
        let stored = self.store.set(&self.record_id(&key_id), &bytes).await;
        bytes.zeroize();
        stored.map_err(|e| ProviderError::Failed(format!("key store write failed: {e}")))?;

        info!(key_id = %key_id, "Generated software ML-DSA-65 device key");
        Ok(key_id)
    }

    async fn attest_key(&self, key_id: &str, challenge: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let (record, secret) = self.load(key_id).await?;
        let input = signing_input(ATTEST_DOMAIN, key_id, challenge);
        let signature = mldsa65::detached_sign(&input, &secret);

        let attestation = SoftwareAttestation {
            format: "mldsa65-software".to_string(),
            key_id: key_id.to_string(),
            public_key: record.public_key.clone(),
            signature: signature.as_bytes().to_vec(),
        };
        let mut object = Vec::new();
        ciborium::into_writer(&attestation, &mut object)
            .map_err(|e| ProviderError::Failed(format!("attestation encoding failed: {e}")))?;
        debug!(key_id = %key_id, bytes = object.len(), "Produced software attestation");
        Ok(object)
    }

    async fn generate_assertion(
        &self,
        key_id: &str,
        client_data_hash: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let (_, secret) = self.load(key_id).await?;
        let signature = mldsa65::detached_sign(
            &signing_input(ASSERT_DOMAIN, key_id, client_data_hash.as_bytes()),
            &secret,
        );
        Ok(signature.as_bytes().to_vec())
    }
}

/// Verify an assertion produced by [`SoftwareAttestationProvider`].
pub fn verify_software_assertion(
    public_key: &[u8],
    key_id: &str,
    client_data_hash: &str,
    assertion: &[u8],
) -> bool {
    let Ok(public_key) = mldsa65::PublicKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = mldsa65::DetachedSignature::from_bytes(assertion) else {
        return false;
    };
    mldsa65::verify_detached_signature(
        &signature,
        &signing_input(ASSERT_DOMAIN, key_id, client_data_hash.as_bytes()),
        &public_key,
    )
    .is_ok()
}
