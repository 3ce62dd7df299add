use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use super::{
    acquire_location, CameraHandle, DepthCaptureProvider, LocationPolicy, LocationProvider,
    PhotoExif, RawCapture,
};
use crate::config::PipelineConfig;
use crate::error::{CaptureError, NotReadyReason};

/// How long `Captured` is shown before reverting to `Idle`.
const CAPTURED_DISPLAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Captured,
}

/// Clears the in-progress flag however the capture ends.
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Takes a photo and a depth frame as one moment.
///
/// Photo, depth and location are requested concurrently. Photo and depth are
/// required; location is best-effort and never changes the outcome. A pair
/// whose timestamps differ by more than the sync window is rejected.
pub struct CaptureOrchestrator {
    camera: Mutex<Option<Arc<dyn CameraHandle>>>,
    depth: Arc<dyn DepthCaptureProvider>,
    location: Option<Arc<dyn LocationProvider>>,
    location_policy: LocationPolicy,
    sync_window_ms: u32,
    depth_ready: AtomicBool,
    in_progress: AtomicBool,
    state: Arc<watch::Sender<CaptureState>>,
    generation: Arc<AtomicU64>,
}

impl CaptureOrchestrator {
    pub fn new(
        depth: Arc<dyn DepthCaptureProvider>,
        location: Option<Arc<dyn LocationProvider>>,
        config: &PipelineConfig,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        Self {
            camera: Mutex::new(None),
            depth,
            location,
            location_policy: config.location,
            sync_window_ms: config.sync_window_ms,
            depth_ready: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub async fn bind_camera(&self, camera: Arc<dyn CameraHandle>) {
        *self.camera.lock().await = Some(camera);
    }

    pub async fn unbind_camera(&self) {
        self.camera.lock().await.take();
    }

    /// Start the depth session. Captures are rejected until this succeeds.
    pub async fn start_depth(&self) -> Result<(), CaptureError> {
        if !self.depth.is_available().await {
            return Err(CaptureError::DepthCaptureFailed(
                "depth sensor not available on this device".into(),
            ));
        }
        self.depth.start_session().await?;
        self.depth_ready.store(true, Ordering::Release);
        debug!("Depth session started");
        Ok(())
    }

    pub async fn stop_depth(&self) -> Result<(), CaptureError> {
        self.depth_ready.store(false, Ordering::Release);
        self.depth.stop_session().await?;
        debug!("Depth session stopped");
        Ok(())
    }

    pub fn is_depth_ready(&self) -> bool {
        self.depth_ready.load(Ordering::Acquire)
    }

    /// Take one synchronized capture.
    #[instrument(level = "info", skip(self))]
    pub async fn capture(&self) -> Result<RawCapture, CaptureError> {
        let camera = self
            .camera
            .lock()
            .await
            .clone()
            .ok_or(CaptureError::NotReady(NotReadyReason::NoCamera))?;
        if !self.is_depth_ready() {
            return Err(CaptureError::NotReady(NotReadyReason::DepthSensorNotReady));
        }
        let _in_progress = InProgress::acquire(&self.in_progress)
            .ok_or(CaptureError::NotReady(NotReadyReason::CaptureInProgress))?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.send_replace(CaptureState::Capturing);
        let start = Instant::now();
        let capture_start_ms = Utc::now().timestamp_millis();

        let (photo, depth, location) = tokio::join!(
            camera.take_photo(),
            self.depth.capture_frame(),
            self.locate(capture_start_ms),
        );

        let outcome = match (photo, depth) {
            (Ok(photo), Ok(frame)) => {
                let photo_ts = photo
                    .exif
                    .as_ref()
                    .and_then(PhotoExif::capture_time_ms)
                    .unwrap_or_else(|| {
                        debug!("No usable EXIF capture time, using capture start");
                        capture_start_ms
                    });
                RawCapture::assemble(photo, frame, photo_ts, location, self.sync_window_ms)
            }
            (Err(e), _) | (_, Err(e)) => Err(CaptureError::from(e)),
        };

        match outcome {
            Ok(raw) => {
                info!(
                    capture_id = %raw.id(),
                    sync_delta_ms = raw.sync_delta_ms(),
                    has_location = raw.location().is_some(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Capture complete"
                );
                self.state.send_replace(CaptureState::Captured);
                self.schedule_revert(generation);
                Ok(raw)
            }
            Err(e) => {
                warn!(error = %e, "Capture failed");
                self.state.send_replace(CaptureState::Idle);
                Err(e)
            }
        }
    }

    async fn locate(&self, now_ms: i64) -> Option<super::CaptureLocation> {
        let provider = self.location.as_deref()?;
        acquire_location(provider, &self.location_policy, now_ms).await
    }

    /// Revert `Captured` to `Idle` unless a newer capture has started.
    fn schedule_revert(&self, generation: u64) {
        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);
        tokio::spawn(async move {
            tokio::time::sleep(CAPTURED_DISPLAY).await;
            if current.load(Ordering::Acquire) == generation {
                state.send_if_modified(|s| {
                    if *s == CaptureState::Captured {
                        *s = CaptureState::Idle;
                        true
                    } else {
                        false
                    }
                });
            }
        });
    }
}
