//! Device attestation: hardware key provider contract, backend challenge
//! service, and the controller that drives challenge-response attestation.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> FetchingChallenge -> Attesting -> Attested
//!              |                   |
//!              +------> Failed <---+   (Failed -> FetchingChallenge on manual retry)
//! ```
//!
//! Attestation never blocks captures. Until the controller reaches
//! `Attested`, the [`AssertionBinder`](crate::AssertionBinder) skips assertion
//! binding and captures upload as unverified.

mod challenge;
mod controller;
mod mock;
#[cfg(feature = "software-attestation")]
mod software;

pub use challenge::{
    AttestationPayload, Challenge, ChallengeBackoff, ChallengeRetryPolicy, ChallengeService,
    DeviceRegistration, RegisteredDevice,
};
#[cfg(feature = "http")]
pub use challenge::HttpChallengeService;
pub use controller::{AttestationController, AttestationSession, AttestationStatus};
pub use mock::{MockAttestationProvider, MockChallengeService};
#[cfg(feature = "software-attestation")]
pub use software::{verify_software_assertion, SoftwareAttestationProvider};

use async_trait::async_trait;

use crate::error::ProviderError;

/// Hardware-backed key operations (Secure Enclave, StrongBox, ...).
///
/// Implementations must classify platform failures into [`ProviderError`]
/// before returning them.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Generate a new hardware key and return its opaque identifier.
    async fn generate_key(&self) -> Result<String, ProviderError>;

    /// Attest `key_id` over the backend challenge, returning the attestation object.
    async fn attest_key(&self, key_id: &str, challenge: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Sign `client_data_hash` with the attested key.
    async fn generate_assertion(
        &self,
        key_id: &str,
        client_data_hash: &str,
    ) -> Result<Vec<u8>, ProviderError>;
}

/// Source of truth for "may captures be bound to a device key right now".
pub trait AttestationReadiness: Send + Sync {
    /// The attested key id, or `None` while the device is unverified.
    fn attested_key_id(&self) -> Option<String>;
}
