//! Exit codes following sysexits.h conventions.
//!
//! Typed errors from `depthproof-core` are found anywhere in the anyhow
//! chain; message matching is only the fallback for CLI-level failures.

use depthproof_core::{
    AttestationError, CaptureError, ProcessingError, QueueError, ServiceError, StorageError,
    UploadError,
};

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Unknown capture id or an operation invalid in the capture's state.
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// Capture rejected: photo and depth out of sync, malformed depth data.
/// Maps to EX_DATAERR from sysexits.h.
pub const DATA_ERROR: i32 = 65;

/// Cannot open input file.
/// Maps to EX_NOINPUT from sysexits.h.
pub const INPUT_ERROR: i32 = 66;

/// Backend unavailable or refusing the device.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const NETWORK_ERROR: i32 = 69;

/// Local storage error (keys, queue file, cached photos).
/// Maps to EX_IOERR from sysexits.h.
pub const IO_ERROR: i32 = 74;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let code = err
            .chain()
            .find_map(classify)
            .unwrap_or_else(|| classify_message(&message));

        Self {
            code,
            message: Some(message),
        }
    }
}

fn classify(err: &(dyn std::error::Error + 'static)) -> Option<i32> {
    if let Some(e) = err.downcast_ref::<CaptureError>() {
        return Some(match e {
            CaptureError::SyncTimeout { .. } => DATA_ERROR,
            _ => GENERAL_ERROR,
        });
    }
    if let Some(e) = err.downcast_ref::<ProcessingError>() {
        return Some(match e {
            ProcessingError::FileReadFailed { .. } => INPUT_ERROR,
            ProcessingError::CompressionFailed(_) => GENERAL_ERROR,
        });
    }
    if let Some(e) = err.downcast_ref::<QueueError>() {
        return Some(match e {
            QueueError::NotFound(_) | QueueError::InvalidState { .. } | QueueError::Duplicate(_) => {
                USAGE_ERROR
            }
            QueueError::Storage(_) => IO_ERROR,
        });
    }
    if let Some(e) = err.downcast_ref::<AttestationError>() {
        return Some(match e {
            AttestationError::KeyUnavailable(_) | AttestationError::Storage(_) => IO_ERROR,
            AttestationError::SecurityFailed(_) | AttestationError::InvalidChallenge(_) => {
                DATA_ERROR
            }
            _ => NETWORK_ERROR,
        });
    }
    if err.is::<UploadError>() || err.is::<ServiceError>() {
        return Some(NETWORK_ERROR);
    }
    if err.is::<StorageError>() {
        return Some(IO_ERROR);
    }
    None
}

fn classify_message(message: &str) -> i32 {
    if message.contains("Failed to read") {
        INPUT_ERROR
    } else if message.contains("does not match") {
        DATA_ERROR
    } else if message.contains("backend unavailable") {
        NETWORK_ERROR
    } else if message.contains("Failed to write") || message.contains("Failed to create") {
        IO_ERROR
    } else {
        GENERAL_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_typed_errors_found_through_context() {
        let err: anyhow::Error = Err::<(), _>(CaptureError::SyncTimeout { sync_delta_ms: 150 })
            .context("Capture rejected")
            .unwrap_err();
        assert_eq!(ExitCode::from_anyhow(&err).code, DATA_ERROR);

        let err = anyhow::Error::new(QueueError::NotFound("x".into()));
        assert_eq!(ExitCode::from_anyhow(&err).code, USAGE_ERROR);

        let err = anyhow::Error::new(AttestationError::ChallengeFailed(ServiceError::Timeout));
        assert_eq!(ExitCode::from_anyhow(&err).code, NETWORK_ERROR);
    }

    #[test]
    fn test_message_fallback() {
        let err = anyhow::anyhow!("Failed to read depth file: missing.bin");
        assert_eq!(ExitCode::from_anyhow(&err).code, INPUT_ERROR);

        let err = anyhow::anyhow!("something else");
        let exit = ExitCode::from_anyhow(&err);
        assert_eq!(exit.code, GENERAL_ERROR);
        assert_eq!(exit.message.as_deref(), Some("something else"));
    }
}
