//! Synchronized photo + depth acquisition.
//!
//! Sensors sit behind pull-model traits ([`CameraHandle`],
//! [`DepthCaptureProvider`], [`LocationProvider`]) so the orchestrator can be
//! driven by real hardware wrappers, the CLI, or the deterministic mocks.

mod location;
mod mock;
mod orchestrator;

pub use location::{acquire_location, LocationPolicy, LocationProvider};
pub use mock::{MockCamera, MockDepthSensor, MockLocationProvider};
pub use orchestrator::{CaptureOrchestrator, CaptureState};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CaptureError, SensorError};

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// One depth reading. Immutable once returned by the sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    pub width: u32,
    pub height: u32,
    /// Sensor timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Raw row-major `f32` grid, little endian.
    pub depth_map: Vec<u8>,
}

impl DepthFrame {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Capture-time tags copied out of the photo's EXIF block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoExif {
    /// `DateTimeOriginal`, e.g. `2024:03:01 12:30:45`.
    pub date_time_original: Option<String>,
    /// `SubSecTimeOriginal`, fractional seconds digits.
    pub sub_sec_time_original: Option<String>,
    /// `OffsetTimeOriginal`, e.g. `+02:00`.
    pub offset_time_original: Option<String>,
}

impl PhotoExif {
    /// Capture instant in epoch milliseconds.
    ///
    /// Without an offset tag the time is read in the device's local zone.
    /// Returns `None` when the date tag is missing or malformed.
    pub fn capture_time_ms(&self) -> Option<i64> {
        let date = self.date_time_original.as_deref()?.trim();

        let seconds_ms = match self.offset_time_original.as_deref().map(str::trim) {
            Some(offset) if !offset.is_empty() => DateTime::parse_from_str(
                &format!("{date} {offset}"),
                &format!("{EXIF_DATE_FORMAT} %:z"),
            )
            .ok()?
            .timestamp_millis(),
            _ => {
                let naive = NaiveDateTime::parse_from_str(date, EXIF_DATE_FORMAT).ok()?;
                Local
                    .from_local_datetime(&naive)
                    .earliest()?
                    .timestamp_millis()
            }
        };

        Some(seconds_ms + self.sub_sec_millis())
    }

    fn sub_sec_millis(&self) -> i64 {
        let Some(digits) = self.sub_sec_time_original.as_deref().map(str::trim) else {
            return 0;
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return 0;
        }
        // "5" is 500ms, "123456" is 123ms.
        let mut millis: String = digits.chars().take(3).collect();
        while millis.len() < 3 {
            millis.push('0');
        }
        millis.parse().unwrap_or(0)
    }
}

/// Photo written by the camera, referenced by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPhoto {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub exif: Option<PhotoExif>,
}

/// Device location attached to a capture when permission allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// When the fix was taken, epoch milliseconds.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geohash: Option<String>,
}

/// A photo and depth frame taken within the sync window.
///
/// Only [`RawCapture::assemble`] builds one, so a value of this type always
/// satisfies `sync_delta_ms <= window`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    id: Uuid,
    photo_path: PathBuf,
    photo_dimensions: Dimensions,
    depth_frame: DepthFrame,
    captured_at: DateTime<Utc>,
    sync_delta_ms: u32,
    location: Option<CaptureLocation>,
}

impl RawCapture {
    /// Pair a photo with a depth frame, enforcing the sync window.
    pub fn assemble(
        photo: CapturedPhoto,
        depth_frame: DepthFrame,
        photo_timestamp_ms: i64,
        location: Option<CaptureLocation>,
        sync_window_ms: u32,
    ) -> Result<Self, CaptureError> {
        let delta = photo_timestamp_ms.abs_diff(depth_frame.timestamp_ms);
        let sync_delta_ms = u32::try_from(delta).unwrap_or(u32::MAX);
        if sync_delta_ms > sync_window_ms {
            return Err(CaptureError::SyncTimeout { sync_delta_ms });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            photo_path: photo.path,
            photo_dimensions: Dimensions {
                width: photo.width,
                height: photo.height,
            },
            depth_frame,
            captured_at: DateTime::from_timestamp_millis(photo_timestamp_ms)
                .unwrap_or_else(Utc::now),
            sync_delta_ms,
            location,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn photo_path(&self) -> &Path {
        &self.photo_path
    }

    pub fn photo_dimensions(&self) -> Dimensions {
        self.photo_dimensions
    }

    pub fn depth_frame(&self) -> &DepthFrame {
        &self.depth_frame
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn sync_delta_ms(&self) -> u32 {
        self.sync_delta_ms
    }

    pub fn location(&self) -> Option<&CaptureLocation> {
        self.location.as_ref()
    }
}

/// A bound camera able to take one photo.
#[async_trait]
pub trait CameraHandle: Send + Sync {
    async fn take_photo(&self) -> Result<CapturedPhoto, SensorError>;
}

/// LiDAR / ToF depth sensor, pull model.
#[async_trait]
pub trait DepthCaptureProvider: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn start_session(&self) -> Result<(), SensorError>;
    async fn stop_session(&self) -> Result<(), SensorError>;
    async fn capture_frame(&self) -> Result<DepthFrame, SensorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo() -> CapturedPhoto {
        CapturedPhoto {
            path: PathBuf::from("/tmp/photo.jpg"),
            width: 4032,
            height: 3024,
            exif: None,
        }
    }

    fn frame(timestamp_ms: i64) -> DepthFrame {
        DepthFrame {
            width: 2,
            height: 2,
            timestamp_ms,
            depth_map: vec![0; 16],
        }
    }

    #[test]
    fn test_sync_window_boundary() {
        let t = 1_700_000_000_000;

        let raw = RawCapture::assemble(photo(), frame(t + 50), t, None, 100).unwrap();
        assert_eq!(raw.sync_delta_ms(), 50);
        assert_eq!(raw.captured_at().timestamp_millis(), t);

        let raw = RawCapture::assemble(photo(), frame(t - 100), t, None, 100).unwrap();
        assert_eq!(raw.sync_delta_ms(), 100);

        assert_eq!(
            RawCapture::assemble(photo(), frame(t + 150), t, None, 100),
            Err(CaptureError::SyncTimeout { sync_delta_ms: 150 })
        );
    }

    #[test]
    fn test_extreme_timestamps_are_out_of_sync() {
        assert_eq!(
            RawCapture::assemble(photo(), frame(i64::MIN), i64::MAX, None, 100),
            Err(CaptureError::SyncTimeout {
                sync_delta_ms: u32::MAX
            })
        );
    }

    #[test]
    fn test_exif_capture_time_with_offset_and_subsec() {
        let exif = PhotoExif {
            date_time_original: Some("2024:03:01 12:30:45".into()),
            sub_sec_time_original: Some("25".into()),
            offset_time_original: Some("+02:00".into()),
        };
        let expected = DateTime::parse_from_rfc3339("2024-03-01T10:30:45.250Z")
            .unwrap()
            .timestamp_millis();
        assert_eq!(exif.capture_time_ms(), Some(expected));
    }

    #[test]
    fn test_exif_without_offset_uses_local_zone() {
        let exif = PhotoExif {
            date_time_original: Some("2024:03:01 12:30:45".into()),
            ..PhotoExif::default()
        };
        let naive = NaiveDateTime::parse_from_str("2024:03:01 12:30:45", EXIF_DATE_FORMAT).unwrap();
        let expected = Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .timestamp_millis();
        assert_eq!(exif.capture_time_ms(), Some(expected));
    }

    #[test]
    fn test_malformed_exif_is_ignored() {
        let exif = PhotoExif {
            date_time_original: Some("yesterday".into()),
            ..PhotoExif::default()
        };
        assert_eq!(exif.capture_time_ms(), None);
        assert_eq!(PhotoExif::default().capture_time_ms(), None);
    }
}
