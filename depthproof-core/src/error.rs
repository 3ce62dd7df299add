use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider error text that marks a genuinely untrusted environment.
const SECURITY_MARKERS: &[&str] = &[
    "jailbreak",
    "security",
    "tamper",
    "compromised",
    "restriction",
    "not supported",
];

/// Failure reported by the hardware attestation provider.
///
/// Platform adapters build this once, at the point where the platform error is
/// received, via [`ProviderError::from_platform_message`]. Nothing downstream
/// inspects error text again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("security restriction: {0}")]
    SecurityRestricted(String),

    #[error("provider network error: {0}")]
    Network(String),

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("provider error: {0}")]
    Failed(String),
}

impl ProviderError {
    /// Classify a raw platform error message.
    pub fn from_platform_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if SECURITY_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::SecurityRestricted(message)
        } else if lower.contains("rate limit") || lower.contains("too many") {
            Self::RateLimited(message)
        } else if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("offline")
        {
            Self::Network(message)
        } else {
            Self::Failed(message)
        }
    }
}

/// Device key lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    #[error("key generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("secure storage failed: {0}")]
    StorageFailed(String),

    #[error("key generation restricted by device security: {0}")]
    SecurityRestricted(String),
}

impl From<ProviderError> for KeyError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::SecurityRestricted(m) => Self::SecurityRestricted(m),
            other => Self::GenerationFailed(other.to_string()),
        }
    }
}

/// Persistence failures in the key store or queue store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),
}

/// Challenge/registration backend failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Network faults and 5xx responses are worth retrying; 4xx never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Attestation controller failures. Recorded on the session, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("device key unavailable: {0}")]
    KeyUnavailable(#[from] KeyError),

    #[error("challenge fetch failed: {0}")]
    ChallengeFailed(ServiceError),

    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),

    #[error("attestation timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error during attestation: {0}")]
    Network(String),

    #[error("device security check failed: {0}")]
    SecurityFailed(String),

    #[error("attestation rate limited: {0}")]
    RateLimited(String),

    #[error("attestation failed: {0}")]
    Failed(String),

    #[error("device registration failed: {0}")]
    RegistrationFailed(ServiceError),

    #[error("failed to persist attestation: {0}")]
    Storage(String),
}

impl AttestationError {
    /// Security failures only leave the Failed state through a manual retry.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Self::SecurityFailed(_) | Self::KeyUnavailable(KeyError::SecurityRestricted(_))
        )
    }
}

impl From<ProviderError> for AttestationError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::SecurityRestricted(m) => Self::SecurityFailed(m),
            ProviderError::Network(m) => Self::Network(m),
            ProviderError::RateLimited(m) => Self::RateLimited(m),
            ProviderError::KeyNotFound(m) | ProviderError::Failed(m) => Self::Failed(m),
        }
    }
}

/// Why a capture could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    NoCamera,
    DepthSensorNotReady,
    CaptureInProgress,
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCamera => write!(f, "no camera bound"),
            Self::DepthSensorNotReady => write!(f, "depth sensor not ready"),
            Self::CaptureInProgress => write!(f, "a capture is already in progress"),
        }
    }
}

/// Capture acquisition failures. These surface synchronously to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture not ready: {0}")]
    NotReady(NotReadyReason),

    #[error("camera error: {0}")]
    CameraError(String),

    #[error("depth capture failed: {0}")]
    DepthCaptureFailed(String),

    #[error("photo and depth readings are {sync_delta_ms}ms apart, outside the sync window")]
    SyncTimeout { sync_delta_ms: u32 },
}

/// Error reported by a camera or depth sensor wrapper.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("camera: {0}")]
    Camera(String),

    #[error("depth: {0}")]
    Depth(String),

    #[error("{0}")]
    Unclassified(String),
}

impl From<SensorError> for CaptureError {
    fn from(err: SensorError) -> Self {
        match err {
            SensorError::Camera(m) => Self::CameraError(m),
            SensorError::Depth(m) => Self::DepthCaptureFailed(m),
            SensorError::Unclassified(m) => {
                if m.to_lowercase().contains("depth") {
                    Self::DepthCaptureFailed(m)
                } else {
                    Self::CameraError(m)
                }
            }
        }
    }
}

/// Location lookup failures. Never affect the capture outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location request timed out")]
    Timeout,

    #[error("location service unavailable: {0}")]
    Unavailable(String),
}

/// Reason an assertion was not produced. Recorded, never returned as an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssertionFailure {
    #[error("device is not attested")]
    NotAttested,

    #[error("failed to hash capture metadata: {0}")]
    HashFailed(String),

    #[error("assertion generation failed: {0}")]
    AssertionFailed(String),
}

/// Local processing failures. The capture is lost and must be retaken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("failed to read photo {path}: {reason}")]
    FileReadFailed { path: String, reason: String },

    #[error("depth map compression failed: {0}")]
    CompressionFailed(String),
}

/// Upload failures. Stored on the queued item and drive the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadError {
    #[error("network error: {message}")]
    NetworkError { message: String },

    #[error("upload timed out")]
    Timeout,

    #[error("rate limited by server")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("server error (status {status})")]
    ServerError {
        status: u16,
        retry_after_ms: Option<u64>,
    },

    #[error("device is not authorized, re-registration required")]
    Unauthorized,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("upload rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("local capture data unavailable: {message}")]
    LocalDataMissing { message: String },

    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. }
                | Self::Timeout
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
        )
    }

    /// Server-provided `Retry-After` hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms } | Self::ServerError { retry_after_ms, .. } => {
                retry_after_ms.map(Duration::from_millis)
            }
            _ => None,
        }
    }

    /// Stable kind tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NetworkError { .. } => "network_error",
            Self::Timeout => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Unauthorized => "unauthorized",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Rejected { .. } => "rejected",
            Self::LocalDataMissing { .. } => "local_data_missing",
            Self::InvalidResponse { .. } => "invalid_response",
        }
    }
}

/// Upload queue management failures.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("capture {0} is already queued")]
    Duplicate(String),

    #[error("capture {0} is not in the queue")]
    NotFound(String),

    #[error("capture {id} cannot be changed while {status}")]
    InvalidState { id: String, status: String },

    #[error("queue storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Errors surfaced by the end-to-end capture pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
