use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::processor::ProcessedCapture;

/// Bytes handed to the transport so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.sent as f64 / self.total as f64
    }
}

/// Backend state of an accepted capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Processing,
    Completed,
}

/// `POST /captures` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub capture_id: String,
    pub verification_url: String,
    pub status: RemoteStatus,
}

/// Transport for one capture upload.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload(
        &self,
        capture: &ProcessedCapture,
        progress: &(dyn Fn(UploadProgress) + Send + Sync),
    ) -> Result<UploadReceipt, UploadError>;
}

#[cfg(feature = "http")]
pub use http::HttpUploadClient;

#[cfg(feature = "http")]
mod http {
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use reqwest::multipart::{Form, Part};
    use reqwest::{Client, StatusCode};
    use tracing::{debug, info, instrument, warn};

    use super::{UploadClient, UploadProgress, UploadReceipt};
    use crate::error::{ServiceError, UploadError};
    use crate::http_client::{build_client, is_transient_status, retry_after_header};
    use crate::processor::ProcessedCapture;

    /// Multipart client for the capture ingestion endpoint.
    pub struct HttpUploadClient {
        client: Client,
        base_url: String,
        device_id: Option<String>,
    }

    impl HttpUploadClient {
        pub fn new(
            base_url: impl Into<String>,
            timeout: Duration,
            allow_insecure_http: bool,
        ) -> Result<Self, ServiceError> {
            let client = build_client(timeout, allow_insecure_http).map_err(|e| {
                ServiceError::Network(format!("Failed to create HTTP client: {e}"))
            })?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                device_id: None,
            })
        }

        /// Send the registered device id with every upload.
        pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
            self.device_id = Some(device_id.into());
            self
        }
    }

    fn part(bytes: Vec<u8>, file_name: &'static str, mime: &str) -> Result<Part, UploadError> {
        Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| UploadError::LocalDataMissing {
                message: format!("invalid part {file_name}: {e}"),
            })
    }

    fn classify_status(
        status: StatusCode,
        retry_after_ms: Option<u64>,
        body: String,
    ) -> UploadError {
        match status {
            StatusCode::UNAUTHORIZED => UploadError::Unauthorized,
            StatusCode::PAYLOAD_TOO_LARGE => UploadError::PayloadTooLarge,
            StatusCode::TOO_MANY_REQUESTS => UploadError::RateLimited { retry_after_ms },
            s if is_transient_status(s) => UploadError::ServerError {
                status: s.as_u16(),
                retry_after_ms,
            },
            s => UploadError::Rejected {
                status: s.as_u16(),
                message: body.chars().take(256).collect(),
            },
        }
    }

    #[async_trait]
    impl UploadClient for HttpUploadClient {
        #[instrument(level = "info", skip_all, fields(capture_id = %capture.id()))]
        async fn upload(
            &self,
            capture: &ProcessedCapture,
            progress: &(dyn Fn(UploadProgress) + Send + Sync),
        ) -> Result<UploadReceipt, UploadError> {
            let start = Instant::now();

            let photo = tokio::fs::read(capture.photo_path()).await.map_err(|e| {
                UploadError::LocalDataMissing {
                    message: format!("{}: {e}", capture.photo_path().display()),
                }
            })?;
            let metadata = serde_json::to_vec(capture.metadata()).map_err(|e| {
                UploadError::LocalDataMissing {
                    message: format!("metadata encoding failed: {e}"),
                }
            })?;
            let detection = capture
                .detection()
                .map(serde_json::to_vec)
                .transpose()
                .map_err(|e| UploadError::LocalDataMissing {
                    message: format!("detection encoding failed: {e}"),
                })?;

            let total = (photo.len()
                + capture.compressed_depth_map().len()
                + metadata.len()
                + detection.as_ref().map_or(0, Vec::len)) as u64;

            let mut form = Form::new()
                .part("photo", part(photo, "photo.jpg", "image/jpeg")?)
                .part(
                    "depth_map",
                    part(
                        capture.compressed_depth_map().to_vec(),
                        "depth_map.bin.gz",
                        "application/gzip",
                    )?,
                )
                .part("metadata", part(metadata, "metadata.json", "application/json")?);
            if let Some(detection) = detection {
                form = form.part(
                    "detection",
                    part(detection, "detection.json", "application/json")?,
                );
            }

            let mut request = self
                .client
                .post(format!("{}/captures", self.base_url))
                .multipart(form);
            if let Some(device_id) = &self.device_id {
                request = request.header("X-Device-Id", device_id);
            }

            progress(UploadProgress { sent: 0, total });
            let response = request.send().await.map_err(|e| {
                warn!(error = %e, latency_ms = start.elapsed().as_millis() as u64, "Upload request failed");
                if e.is_timeout() {
                    UploadError::Timeout
                } else {
                    UploadError::NetworkError {
                        message: e.to_string(),
                    }
                }
            })?;
            progress(UploadProgress { sent: total, total });

            let status = response.status();
            if !status.is_success() {
                let retry_after_ms =
                    retry_after_header(&response).map(|d| d.as_millis() as u64);
                let body = response.text().await.unwrap_or_default();
                let error = classify_status(status, retry_after_ms, body);
                warn!(
                    status = status.as_u16(),
                    kind = error.kind(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Upload rejected"
                );
                return Err(error);
            }

            let receipt: UploadReceipt =
                response
                    .json()
                    .await
                    .map_err(|e| UploadError::InvalidResponse {
                        message: e.to_string(),
                    })?;
            info!(
                remote_id = %receipt.capture_id,
                bytes = total,
                latency_ms = start.elapsed().as_millis() as u64,
                "Capture uploaded"
            );
            debug!(verification_url = %receipt.verification_url, "Verification page");
            Ok(receipt)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_status_classification() {
            assert_eq!(
                classify_status(StatusCode::UNAUTHORIZED, None, String::new()),
                UploadError::Unauthorized
            );
            assert_eq!(
                classify_status(StatusCode::PAYLOAD_TOO_LARGE, None, String::new()),
                UploadError::PayloadTooLarge
            );
            assert_eq!(
                classify_status(StatusCode::TOO_MANY_REQUESTS, Some(30_000), String::new()),
                UploadError::RateLimited {
                    retry_after_ms: Some(30_000)
                }
            );
            assert_eq!(
                classify_status(StatusCode::BAD_GATEWAY, None, String::new()),
                UploadError::ServerError {
                    status: 502,
                    retry_after_ms: None
                }
            );
            assert!(matches!(
                classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, "bad hash".into()),
                UploadError::Rejected { status: 422, .. }
            ));
        }
    }
}
