//! Capture backends: the seam between the shared camera manager and a
//! physical (or synthetic) video device.

use image::{Rgb, RgbImage};
use tracing::debug;

use crate::camera::CameraError;
use crate::video_settings::VideoSettings;

/// Opens video devices by index.
pub trait CaptureBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Open device `index` configured with `settings`.
    fn open(&self, index: u32, settings: &VideoSettings)
        -> Result<Box<dyn VideoDevice>, CameraError>;
}

/// An open video device. Only ever driven by one caller at a time.
pub trait VideoDevice: Send {
    /// Read the next frame as packed RGB.
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;

    /// Reconfigure the device. On error the device may be left in any state
    /// and the caller is responsible for re-applying known-good settings.
    fn apply_settings(&mut self, settings: &VideoSettings) -> Result<(), CameraError>;

    fn is_open(&self) -> bool;

    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Synthetic device producing a moving gradient, for demos and hardware-less hosts.
pub struct TestPatternBackend {
    available: Vec<u32>,
}

impl TestPatternBackend {
    /// Backend where only the listed indices open.
    pub fn new(available: Vec<u32>) -> Self {
        Self { available }
    }
}

impl Default for TestPatternBackend {
    fn default() -> Self {
        Self::new(vec![0])
    }
}

impl CaptureBackend for TestPatternBackend {
    fn name(&self) -> &'static str {
        "test-pattern"
    }

    fn open(
        &self,
        index: u32,
        settings: &VideoSettings,
    ) -> Result<Box<dyn VideoDevice>, CameraError> {
        if !self.available.contains(&index) {
            return Err(CameraError::OpenFailed {
                index,
                reason: "no such test pattern device".to_string(),
            });
        }
        debug!(index, width = settings.width, height = settings.height, "Test pattern opened");
        Ok(Box::new(TestPatternDevice {
            settings: *settings,
            tick: 0,
            open: true,
        }))
    }
}

struct TestPatternDevice {
    settings: VideoSettings,
    tick: u32,
    open: bool,
}

impl VideoDevice for TestPatternDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        if !self.open {
            return Err(CameraError::ReadFailed("device closed".to_string()));
        }
        let VideoSettings { width, height, .. } = self.settings;
        let bar = self.tick % width.max(1);
        self.tick = self.tick.wrapping_add(4);

        Ok(RgbImage::from_fn(width, height, |x, y| {
            if x.abs_diff(bar) < 8 {
                Rgb([255, 255, 255])
            } else {
                Rgb([
                    (x * 255 / width.max(1)) as u8,
                    (y * 255 / height.max(1)) as u8,
                    96,
                ])
            }
        }))
    }

    fn apply_settings(&mut self, settings: &VideoSettings) -> Result<(), CameraError> {
        self.settings = *settings;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Backend that never opens; used when the configured backend is not compiled in.
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl CaptureBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn open(
        &self,
        _index: u32,
        _settings: &VideoSettings,
    ) -> Result<Box<dyn VideoDevice>, CameraError> {
        Err(CameraError::BackendUnavailable(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VideoSettings {
        VideoSettings {
            width: 64,
            height: 48,
            fps: 30,
            quality: 80,
        }
    }

    #[test]
    fn test_pattern_frames_match_settings() {
        let backend = TestPatternBackend::default();
        let mut device = backend.open(0, &settings()).unwrap();
        let frame = device.read_frame().unwrap();
        assert_eq!(frame.dimensions(), (64, 48));
    }

    #[test]
    fn test_pattern_rejects_unknown_index() {
        let backend = TestPatternBackend::new(vec![2]);
        assert!(backend.open(0, &settings()).is_err());
        assert!(backend.open(2, &settings()).is_ok());
    }

    #[test]
    fn test_pattern_apply_settings_changes_size() {
        let backend = TestPatternBackend::default();
        let mut device = backend.open(0, &settings()).unwrap();
        let mut bigger = settings();
        bigger.width = 128;
        device.apply_settings(&bigger).unwrap();
        assert_eq!(device.read_frame().unwrap().width(), 128);
    }

    #[test]
    fn test_closed_device_fails_reads() {
        let backend = TestPatternBackend::default();
        let mut device = backend.open(0, &settings()).unwrap();
        device.close();
        assert!(!device.is_open());
        assert!(device.read_frame().is_err());
    }

    #[test]
    fn test_unavailable_backend_never_opens() {
        let backend = UnavailableBackend::new("not compiled");
        assert!(matches!(
            backend.open(0, &settings()),
            Err(CameraError::BackendUnavailable(_))
        ));
    }
}
