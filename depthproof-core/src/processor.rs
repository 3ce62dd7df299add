//! Local capture processing: photo hash, depth compression, metadata.
//!
//! Processing is offline and idempotent. It runs in two steps so the
//! assertion can sign the final metadata:
//!
//! ```text
//! RawCapture --prepare--> PreparedCapture --bind--> CaptureAssertion?
//!                              |                          |
//!                              +--------finish------------+--> ProcessedCapture
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::assertion::CaptureAssertion;
use crate::capture::{CaptureLocation, Dimensions, RawCapture};
use crate::config::PipelineConfig;
use crate::digest::{base64_bytes, sha256_hex};
use crate::error::ProcessingError;

/// Metadata uploaded with every capture and covered by its assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub captured_at: DateTime<Utc>,
    pub device_model: String,
    /// SHA-256 hex of the photo file.
    pub photo_hash: String,
    /// SHA-256 hex of the raw depth grid.
    pub depth_map_hash: String,
    pub depth_map_dimensions: Dimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<CaptureLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<CaptureAssertion>,
}

/// Field-for-field view of [`CaptureMetadata`] minus the assertion.
///
/// Field order here is the signed byte order. Do not reorder.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignableMetadata<'a> {
    captured_at: &'a DateTime<Utc>,
    device_model: &'a str,
    photo_hash: &'a str,
    depth_map_hash: &'a str,
    depth_map_dimensions: &'a Dimensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a CaptureLocation>,
}

impl CaptureMetadata {
    /// Deterministic JSON encoding of every field except the assertion.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SignableMetadata {
            captured_at: &self.captured_at,
            device_model: &self.device_model,
            photo_hash: &self.photo_hash,
            depth_map_hash: &self.depth_map_hash,
            depth_map_dimensions: &self.depth_map_dimensions,
            location: self.location.as_ref(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Ready,
}

/// A capture ready for upload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedCapture {
    id: Uuid,
    photo_path: PathBuf,
    photo_hash: String,
    #[serde(with = "base64_bytes")]
    compressed_depth_map: Vec<u8>,
    depth_dimensions: Dimensions,
    metadata: CaptureMetadata,
    #[serde(default)]
    detection: Option<serde_json::Value>,
    status: CaptureStatus,
}

impl ProcessedCapture {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn photo_path(&self) -> &Path {
        &self.photo_path
    }

    pub fn photo_hash(&self) -> &str {
        &self.photo_hash
    }

    /// Gzip-compressed raw depth grid.
    pub fn compressed_depth_map(&self) -> &[u8] {
        &self.compressed_depth_map
    }

    pub fn depth_dimensions(&self) -> Dimensions {
        self.depth_dimensions
    }

    pub fn metadata(&self) -> &CaptureMetadata {
        &self.metadata
    }

    pub fn assertion(&self) -> Option<&CaptureAssertion> {
        self.metadata.assertion.as_ref()
    }

    /// Optional on-device detection results, uploaded as a separate part.
    pub fn detection(&self) -> Option<&serde_json::Value> {
        self.detection.as_ref()
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    pub fn with_detection(mut self, detection: serde_json::Value) -> Self {
        self.detection = Some(detection);
        self
    }

    /// Drop the cached depth payload once the backend holds it.
    pub(crate) fn release_depth_map(&mut self) {
        self.compressed_depth_map = Vec::new();
    }
}

/// Hashed and compressed capture awaiting its (optional) assertion.
#[derive(Debug, Clone)]
pub struct PreparedCapture {
    id: Uuid,
    photo_path: PathBuf,
    compressed_depth_map: Vec<u8>,
    metadata: CaptureMetadata,
}

impl PreparedCapture {
    /// The metadata an assertion must sign.
    pub fn metadata(&self) -> &CaptureMetadata {
        &self.metadata
    }

    pub fn finish(self, assertion: Option<CaptureAssertion>) -> ProcessedCapture {
        let mut metadata = self.metadata;
        metadata.assertion = assertion;
        ProcessedCapture {
            id: self.id,
            photo_path: self.photo_path,
            photo_hash: metadata.photo_hash.clone(),
            compressed_depth_map: self.compressed_depth_map,
            depth_dimensions: metadata.depth_map_dimensions,
            metadata,
            detection: None,
            status: CaptureStatus::Ready,
        }
    }
}

/// Turns a [`RawCapture`] into an uploadable [`ProcessedCapture`].
#[derive(Debug, Clone)]
pub struct CaptureProcessor {
    device_model: String,
    geohash_precision: Option<usize>,
}

impl CaptureProcessor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            device_model: config.device_model.clone(),
            geohash_precision: config.location_geohash_precision,
        }
    }

    /// Hash, compress and build metadata. The photo file is only read.
    #[instrument(level = "debug", skip_all, fields(capture_id = %raw.id()))]
    pub async fn prepare(&self, raw: &RawCapture) -> Result<PreparedCapture, ProcessingError> {
        let start = Instant::now();
        let path = raw.photo_path().to_path_buf();

        let photo = tokio::fs::read(&path)
            .await
            .map_err(|e| ProcessingError::FileReadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let depth_map = raw.depth_frame().depth_map.clone();
        let (photo_hash, depth_map_hash, compressed) = tokio::task::spawn_blocking(move || {
            let compressed = compress_depth_map(&depth_map)?;
            Ok::<_, ProcessingError>((sha256_hex(&photo), sha256_hex(&depth_map), compressed))
        })
        .await
        .map_err(|e| ProcessingError::CompressionFailed(e.to_string()))??;

        let location = raw.location().cloned().map(|mut location| {
            location.geohash = self.geohash_for(&location);
            location
        });

        debug!(
            photo_hash = %photo_hash,
            depth_bytes = raw.depth_frame().depth_map.len(),
            compressed_bytes = compressed.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Capture prepared"
        );

        Ok(PreparedCapture {
            id: raw.id(),
            photo_path: path,
            compressed_depth_map: compressed,
            metadata: CaptureMetadata {
                captured_at: raw.captured_at(),
                device_model: self.device_model.clone(),
                photo_hash,
                depth_map_hash,
                depth_map_dimensions: raw.depth_frame().dimensions(),
                location,
                assertion: None,
            },
        })
    }

    /// [`prepare`](Self::prepare) and [`finish`](PreparedCapture::finish) in one step.
    pub async fn process(
        &self,
        raw: &RawCapture,
        assertion: Option<CaptureAssertion>,
    ) -> Result<ProcessedCapture, ProcessingError> {
        Ok(self.prepare(raw).await?.finish(assertion))
    }

    fn geohash_for(&self, location: &CaptureLocation) -> Option<String> {
        let precision = self.geohash_precision?;
        let coord = geohash::Coord {
            x: location.longitude,
            y: location.latitude,
        };
        match geohash::encode(coord, precision) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!(error = ?e, "Could not geohash capture location");
                None
            }
        }
    }
}

/// Gzip the raw depth grid.
pub fn compress_depth_map(depth_map: &[u8]) -> Result<Vec<u8>, ProcessingError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(depth_map)
        .map_err(|e| ProcessingError::CompressionFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProcessingError::CompressionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CapturedPhoto, DepthFrame};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn raw_capture(dir: &TempDir, location: Option<CaptureLocation>) -> RawCapture {
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg bytes").unwrap();
        RawCapture::assemble(
            CapturedPhoto {
                path,
                width: 4032,
                height: 3024,
                exif: None,
            },
            DepthFrame {
                width: 2,
                height: 1,
                timestamp_ms: 1_700_000_000_020,
                depth_map: [1.0f32.to_le_bytes(), 2.0f32.to_le_bytes()].concat(),
            },
            1_700_000_000_000,
            location,
            100,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_process_hashes_and_compresses() {
        let dir = TempDir::new().unwrap();
        let raw = raw_capture(&dir, None);
        let config = PipelineConfig {
            device_model: "iPhone15,3".into(),
            ..PipelineConfig::default()
        };

        let processed = CaptureProcessor::new(&config).process(&raw, None).await.unwrap();

        assert_eq!(processed.id(), raw.id());
        assert_eq!(processed.photo_hash(), sha256_hex(b"jpeg bytes"));
        assert_eq!(processed.status(), CaptureStatus::Ready);
        assert_eq!(processed.metadata().device_model, "iPhone15,3");
        assert_eq!(
            processed.depth_dimensions(),
            Dimensions {
                width: 2,
                height: 1
            }
        );
        assert!(processed.assertion().is_none());

        let mut decompressed = Vec::new();
        GzDecoder::new(processed.compressed_depth_map())
            .read_to_end(&mut decompressed)
            .unwrap();
        assert_eq!(decompressed, raw.depth_frame().depth_map);
        assert_eq!(processed.metadata().depth_map_hash, sha256_hex(&decompressed));
    }

    #[tokio::test]
    async fn test_processing_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let raw = raw_capture(&dir, None);
        let processor = CaptureProcessor::new(&PipelineConfig::default());

        let a = processor.process(&raw, None).await.unwrap();
        let b = processor.process(&raw, None).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_missing_photo_is_file_read_failure() {
        let dir = TempDir::new().unwrap();
        let raw = raw_capture(&dir, None);
        std::fs::remove_file(raw.photo_path()).unwrap();

        let err = CaptureProcessor::new(&PipelineConfig::default())
            .process(&raw, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::FileReadFailed { .. }));
    }

    #[tokio::test]
    async fn test_geohash_precision_applied() {
        let dir = TempDir::new().unwrap();
        let raw = raw_capture(
            &dir,
            Some(CaptureLocation {
                latitude: 48.8566,
                longitude: 2.3522,
                altitude: None,
                accuracy: None,
                timestamp_ms: 1_700_000_000_000,
                geohash: None,
            }),
        );
        let config = PipelineConfig {
            location_geohash_precision: Some(6),
            ..PipelineConfig::default()
        };

        let processed = CaptureProcessor::new(&config).process(&raw, None).await.unwrap();
        let location = processed.metadata().location.as_ref().unwrap();
        assert_eq!(location.geohash.as_deref(), Some("u09tvw"));
    }

    #[test]
    fn test_signable_bytes_exclude_assertion() {
        let mut metadata = CaptureMetadata {
            captured_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            device_model: "Pixel 8".into(),
            photo_hash: "aa".into(),
            depth_map_hash: "bb".into(),
            depth_map_dimensions: Dimensions {
                width: 256,
                height: 192,
            },
            location: None,
            assertion: None,
        };
        let unsigned = metadata.signable_bytes().unwrap();
        metadata.assertion = Some(CaptureAssertion {
            assertion: vec![1, 2, 3],
            client_data_hash: "hash".into(),
            timestamp: Utc::now(),
        });

        assert_eq!(metadata.signable_bytes().unwrap(), unsigned);
        let text = String::from_utf8(unsigned).unwrap();
        assert!(text.starts_with(r#"{"capturedAt":"#));
        assert!(text.contains(r#""depthMapDimensions":{"width":256,"height":192}"#));
    }
}
