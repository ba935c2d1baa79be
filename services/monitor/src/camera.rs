//! Shared camera with session reference counting.
//!
//! One physical device serves every viewer. The device is opened when the
//! first session registers and released when the last one leaves. Opening,
//! closing, reconfiguring and reading all happen under one mutex; reads within
//! the same frame period are served from a cache so concurrent viewers share a
//! single physical read per tick.

use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::capture_device::{CaptureBackend, VideoDevice};
use crate::video_settings::{VideoMode, VideoSettings, VideoSettingsUpdate};

/// Indices probed after the configured one fails.
const FALLBACK_DEVICE_INDICES: [u32; 4] = [0, 1, 2, 3];

/// Errors that can occur during camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Failed to open device {index}: {reason}")]
    OpenFailed { index: u32, reason: String },

    #[error("Frame read failed: {0}")]
    ReadFailed(String),

    #[error("Device returned an empty frame")]
    EmptyFrame,

    #[error("No usable camera device (tried {tried:?})")]
    NoUsableDevice { tried: Vec<u32> },

    #[error("No active sessions")]
    NoActiveSessions,

    #[error("Invalid video settings: {0}")]
    InvalidSettings(String),

    #[error("Device rejected settings: {0}")]
    SettingsRejected(String),

    #[error("Capture backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Snapshot of the camera for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub backend: &'static str,
    pub active: bool,
    pub device_index: Option<u32>,
    pub session_count: usize,
    pub settings: VideoSettings,
    pub mode: VideoMode,
}

struct CameraInner {
    device: Option<Box<dyn VideoDevice>>,
    sessions: HashSet<String>,
    settings: VideoSettings,
    device_index: Option<u32>,
    last_frame: Option<(Instant, Arc<RgbImage>)>,
    read_failures: u32,
}

impl CameraInner {
    fn is_active(&self) -> bool {
        !self.sessions.is_empty() && self.device.as_ref().is_some_and(|d| d.is_open())
    }

    fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.last_frame = None;
        self.read_failures = 0;
    }
}

/// The process-wide camera shared by all viewer sessions.
pub struct SharedCamera {
    backend: Arc<dyn CaptureBackend>,
    preferred_index: u32,
    max_read_failures: u32,
    inner: Mutex<CameraInner>,
}

impl SharedCamera {
    /// Create a camera manager. No device is opened until a session registers.
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        preferred_index: u32,
        settings: VideoSettings,
        max_read_failures: u32,
    ) -> Self {
        Self {
            backend,
            preferred_index,
            max_read_failures: max_read_failures.max(1),
            inner: Mutex::new(CameraInner {
                device: None,
                sessions: HashSet::new(),
                settings,
                device_index: None,
                last_frame: None,
                read_failures: 0,
            }),
        }
    }

    /// Register a viewer session, opening the device for the first one.
    ///
    /// When the open fails the session stays registered; callers re-check
    /// [`is_active`](Self::is_active) and retry via
    /// [`start_capture`](Self::start_capture).
    pub fn add_session(&self, session_id: &str) -> Result<(), CameraError> {
        let mut inner = self.inner.lock();
        if !inner.sessions.insert(session_id.to_string()) {
            return Ok(());
        }

        metrics::gauge!("monitor.sessions.active").set(inner.sessions.len() as f64);
        info!(
            session_id = %session_id,
            sessions = inner.sessions.len(),
            "Camera session registered"
        );

        if inner.sessions.len() == 1 {
            self.open_device(&mut inner)?;
        }
        Ok(())
    }

    /// Deregister a viewer session, releasing the device after the last one.
    pub fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        if !inner.sessions.remove(session_id) {
            return;
        }

        metrics::gauge!("monitor.sessions.active").set(inner.sessions.len() as f64);
        info!(
            session_id = %session_id,
            sessions = inner.sessions.len(),
            "Camera session removed"
        );

        if inner.sessions.is_empty() {
            inner.release();
            inner.device_index = None;
            info!("Last session left, camera released");
        }
    }

    /// True when the device is open and at least one session is registered.
    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active()
    }

    /// Open the device if sessions exist and it is not already open.
    pub fn start_capture(&self) -> Result<(), CameraError> {
        let mut inner = self.inner.lock();
        if inner.is_active() {
            return Ok(());
        }
        if inner.sessions.is_empty() {
            return Err(CameraError::NoActiveSessions);
        }
        self.open_device(&mut inner)
    }

    /// Current frame, shared with every caller within the same frame period.
    ///
    /// Returns `Ok(None)` when the camera is not active.
    pub fn get_frame(&self) -> Result<Option<Arc<RgbImage>>, CameraError> {
        let mut inner = self.inner.lock();
        if !inner.is_active() {
            return Ok(None);
        }

        let period = Duration::from_secs_f64(1.0 / inner.settings.fps.max(1) as f64);
        if let Some((read_at, frame)) = &inner.last_frame {
            if read_at.elapsed() < period {
                return Ok(Some(Arc::clone(frame)));
            }
        }

        let result = match inner.device.as_mut() {
            Some(device) => device.read_frame().and_then(non_empty),
            None => return Ok(None),
        };

        match result {
            Ok(frame) => {
                let frame = Arc::new(frame);
                inner.last_frame = Some((Instant::now(), Arc::clone(&frame)));
                inner.read_failures = 0;
                Ok(Some(frame))
            }
            Err(e) => {
                inner.read_failures += 1;
                warn!(
                    error = %e,
                    consecutive_failures = inner.read_failures,
                    "Camera read failed"
                );
                if inner.read_failures >= self.max_read_failures {
                    error!(
                        failures = inner.read_failures,
                        "Releasing camera after repeated read failures"
                    );
                    inner.release();
                }
                Err(e)
            }
        }
    }

    /// Current video settings.
    pub fn settings(&self) -> VideoSettings {
        self.inner.lock().settings
    }

    /// Merge `update` into the settings, applying it to an active device.
    ///
    /// An active device is reconfigured and verified with a test frame before
    /// the new settings are committed. On failure the previous settings are
    /// re-applied and `settings()` is unchanged.
    pub fn update_settings(
        &self,
        update: &VideoSettingsUpdate,
    ) -> Result<VideoSettings, CameraError> {
        let mut inner = self.inner.lock();
        let previous = inner.settings;
        let candidate = previous.merged(update);
        candidate.validate().map_err(CameraError::InvalidSettings)?;

        if !inner.is_active() {
            inner.settings = candidate;
            info!(?candidate, "Camera settings stored for next open");
            return Ok(candidate);
        }

        let outcome = match inner.device.as_mut() {
            Some(device) => apply_and_verify(device.as_mut(), &candidate),
            None => Err(CameraError::NoActiveSessions),
        };

        match outcome {
            Ok(()) => {
                inner.settings = candidate;
                inner.last_frame = None;
                info!(
                    width = candidate.width,
                    height = candidate.height,
                    fps = candidate.fps,
                    quality = candidate.quality,
                    mode = ?candidate.mode(),
                    "Camera settings applied"
                );
                Ok(candidate)
            }
            Err(e) => {
                warn!(error = %e, "Camera rejected settings, rolling back");
                let restored = inner
                    .device
                    .as_mut()
                    .map(|device| apply_and_verify(device.as_mut(), &previous));
                if let Some(Err(restore_err)) = restored {
                    error!(
                        error = %restore_err,
                        "Failed to restore previous settings, releasing camera"
                    );
                    inner.release();
                }
                Err(CameraError::SettingsRejected(e.to_string()))
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Device index adopted by the last successful open.
    pub fn device_index(&self) -> Option<u32> {
        self.inner.lock().device_index
    }

    pub fn camera_info(&self) -> CameraInfo {
        let inner = self.inner.lock();
        CameraInfo {
            backend: self.backend.name(),
            active: inner.is_active(),
            device_index: inner.device_index,
            session_count: inner.sessions.len(),
            settings: inner.settings,
            mode: inner.settings.mode(),
        }
    }

    /// Close the device regardless of sessions, for shutdown.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.release();
        inner.sessions.clear();
        info!("Camera shut down");
    }

    /// Try the preferred index, then the fallback indices, adopting the first
    /// device that opens and yields a non-empty frame.
    fn open_device(&self, inner: &mut CameraInner) -> Result<(), CameraError> {
        inner.release();

        let mut candidates = vec![self.preferred_index];
        candidates.extend(
            FALLBACK_DEVICE_INDICES
                .iter()
                .copied()
                .filter(|i| *i != self.preferred_index),
        );

        let settings = inner.settings;
        for index in &candidates {
            match self.try_open(*index, &settings) {
                Ok((device, frame)) => {
                    info!(
                        backend = self.backend.name(),
                        device_index = index,
                        width = frame.width(),
                        height = frame.height(),
                        mode = ?settings.mode(),
                        "Camera opened"
                    );
                    inner.device = Some(device);
                    inner.device_index = Some(*index);
                    inner.last_frame = Some((Instant::now(), Arc::new(frame)));
                    return Ok(());
                }
                Err(e) => {
                    metrics::counter!("monitor.camera.open_failures").increment(1);
                    debug!(device_index = index, error = %e, "Camera candidate failed");
                }
            }
        }

        error!(tried = ?candidates, "No usable camera device");
        Err(CameraError::NoUsableDevice { tried: candidates })
    }

    fn try_open(
        &self,
        index: u32,
        settings: &VideoSettings,
    ) -> Result<(Box<dyn VideoDevice>, RgbImage), CameraError> {
        let mut device = self.backend.open(index, settings)?;
        if !device.is_open() {
            return Err(CameraError::OpenFailed {
                index,
                reason: "device reported closed after open".to_string(),
            });
        }
        match device.read_frame().and_then(non_empty) {
            Ok(frame) => Ok((device, frame)),
            Err(e) => {
                device.close();
                Err(e)
            }
        }
    }
}

impl Drop for SharedCamera {
    fn drop(&mut self) {
        self.inner.get_mut().release();
    }
}

fn non_empty(frame: RgbImage) -> Result<RgbImage, CameraError> {
    if frame.width() == 0 || frame.height() == 0 {
        Err(CameraError::EmptyFrame)
    } else {
        Ok(frame)
    }
}

fn apply_and_verify(
    device: &mut dyn VideoDevice,
    settings: &VideoSettings,
) -> Result<(), CameraError> {
    device.apply_settings(settings)?;
    device.read_frame().and_then(non_empty).map(|_| ())
}
