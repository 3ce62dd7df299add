//! Deterministic sensor doubles for tests and simulators.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CameraHandle, CaptureLocation, CapturedPhoto, DepthCaptureProvider, DepthFrame,
    LocationProvider, PhotoExif,
};
use crate::error::{LocationError, SensorError};

/// Camera returning a fixed photo path.
pub struct MockCamera {
    path: PathBuf,
    width: u32,
    height: u32,
    capture_time_ms: Option<i64>,
    delay: Duration,
    failure: Option<SensorError>,
    calls: AtomicUsize,
}

impl MockCamera {
    pub fn new(path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            capture_time_ms: None,
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Embed EXIF capture-time tags (UTC) for `timestamp_ms`.
    pub fn with_capture_time(mut self, timestamp_ms: i64) -> Self {
        self.capture_time_ms = Some(timestamp_ms);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: SensorError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn exif(&self) -> Option<PhotoExif> {
        let at = DateTime::<Utc>::from_timestamp_millis(self.capture_time_ms?)?;
        Some(PhotoExif {
            date_time_original: Some(at.format("%Y:%m:%d %H:%M:%S").to_string()),
            sub_sec_time_original: Some(format!("{:03}", at.timestamp_subsec_millis())),
            offset_time_original: Some("+00:00".to_string()),
        })
    }
}

#[async_trait]
impl CameraHandle for MockCamera {
    async fn take_photo(&self) -> Result<CapturedPhoto, SensorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(CapturedPhoto {
            path: self.path.clone(),
            width: self.width,
            height: self.height,
            exif: self.exif(),
        })
    }
}

/// Depth sensor producing a flat 1.5m grid.
pub struct MockDepthSensor {
    width: u32,
    height: u32,
    timestamp_ms: Option<i64>,
    available: bool,
    failure: Option<SensorError>,
    session_active: AtomicBool,
    frames: AtomicUsize,
}

impl MockDepthSensor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            timestamp_ms: None,
            available: true,
            failure: None,
            session_active: AtomicBool::new(false),
            frames: AtomicUsize::new(0),
        }
    }

    /// Stamp every frame with `timestamp_ms` instead of the wall clock.
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(0, 0)
        }
    }

    pub fn failing(mut self, error: SensorError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn is_session_active(&self) -> bool {
        self.session_active.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DepthCaptureProvider for MockDepthSensor {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn start_session(&self) -> Result<(), SensorError> {
        if !self.available {
            return Err(SensorError::Depth("no depth sensor on this device".into()));
        }
        self.session_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_session(&self) -> Result<(), SensorError> {
        self.session_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_frame(&self) -> Result<DepthFrame, SensorError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if !self.is_session_active() {
            return Err(SensorError::Depth("depth session not running".into()));
        }
        self.frames.fetch_add(1, Ordering::SeqCst);

        let cells = (self.width * self.height) as usize;
        let depth_map = std::iter::repeat(1.5f32.to_le_bytes())
            .take(cells)
            .flatten()
            .collect();
        Ok(DepthFrame {
            width: self.width,
            height: self.height,
            timestamp_ms: self
                .timestamp_ms
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            depth_map,
        })
    }
}

/// Location service with a scripted cached fix and optional fresh fix.
pub struct MockLocationProvider {
    permission: bool,
    cached: Result<CaptureLocation, LocationError>,
    fresh: Option<Result<CaptureLocation, LocationError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockLocationProvider {
    pub fn new(location: CaptureLocation) -> Self {
        Self {
            permission: true,
            cached: Ok(location),
            fresh: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn denied() -> Self {
        Self {
            permission: false,
            cached: Err(LocationError::PermissionDenied),
            fresh: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: LocationError) -> Self {
        Self {
            cached: Err(error),
            ..Self::denied()
        }
        .with_permission()
    }

    /// Result returned when a fresh fix is requested.
    pub fn with_fresh(mut self, fresh: Result<CaptureLocation, LocationError>) -> Self {
        self.fresh = Some(fresh);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_permission(mut self) -> Self {
        self.permission = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    async fn has_permission(&self) -> bool {
        self.permission
    }

    async fn current_location(&self, fresh: bool) -> Result<CaptureLocation, LocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (&self.fresh, fresh) {
            (Some(result), true) => result.clone(),
            _ => self.cached.clone(),
        }
    }
}
