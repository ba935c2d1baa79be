//! Video capture settings, device modes and named quality presets.

use serde::{Deserialize, Serialize};

/// Resolution, frame rate and encoding quality requested from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// JPEG quality (1-100) for streamed and captured frames
    pub quality: u8,
}

/// Partial settings update; unset fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct VideoSettingsUpdate {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub quality: Option<u8>,
}

/// Device configuration class derived from the requested resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoMode {
    /// 4K and above: compressed device format, single buffered frame
    HighResolution,
    /// Everything else: raw device format
    Standard,
}

impl VideoMode {
    /// Pure function of the requested resolution; not negotiated with hardware.
    pub fn for_resolution(width: u32, height: u32) -> Self {
        if width >= 3840 && height >= 2160 {
            VideoMode::HighResolution
        } else {
            VideoMode::Standard
        }
    }

    /// Caps requested from the device: MJPG for high resolution, YUYV otherwise.
    pub fn source_caps(&self) -> &'static str {
        match self {
            VideoMode::HighResolution => "image/jpeg",
            VideoMode::Standard => "video/x-raw,format=YUY2",
        }
    }

    /// Element decoding the device format into raw video, if it is compressed.
    pub fn decoder(&self) -> Option<&'static str> {
        match self {
            VideoMode::HighResolution => Some("jpegdec"),
            VideoMode::Standard => None,
        }
    }

    /// Frames buffered between the device and the reader.
    pub fn buffer_size(&self) -> u32 {
        match self {
            VideoMode::HighResolution => 1,
            VideoMode::Standard => 3,
        }
    }
}

impl VideoSettings {
    pub fn mode(&self) -> VideoMode {
        VideoMode::for_resolution(self.width, self.height)
    }

    /// Settings with the update's fields applied.
    pub fn merged(&self, update: &VideoSettingsUpdate) -> Self {
        Self {
            width: update.width.unwrap_or(self.width),
            height: update.height.unwrap_or(self.height),
            fps: update.fps.unwrap_or(self.fps),
            quality: update.quality.unwrap_or(self.quality),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("Dimensions must be greater than 0".to_string());
        }
        if self.fps == 0 {
            return Err("FPS must be greater than 0".to_string());
        }
        if !(1..=100).contains(&self.quality) {
            return Err("Quality must be between 1 and 100".to_string());
        }
        Ok(())
    }
}

impl From<VideoSettings> for VideoSettingsUpdate {
    fn from(settings: VideoSettings) -> Self {
        Self {
            width: Some(settings.width),
            height: Some(settings.height),
            fps: Some(settings.fps),
            quality: Some(settings.quality),
        }
    }
}

/// A named bundle of resolution, frame rate and encoding quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityPreset {
    pub name: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
}

impl QualityPreset {
    pub fn settings(&self) -> VideoSettings {
        VideoSettings {
            width: self.width,
            height: self.height,
            fps: self.fps,
            quality: self.quality,
        }
    }
}

pub const QUALITY_PRESETS: &[QualityPreset] = &[
    QualityPreset {
        name: "low",
        label: "Low",
        description: "640x480 at 15 fps for slow links",
        width: 640,
        height: 480,
        fps: 15,
        quality: 70,
    },
    QualityPreset {
        name: "medium",
        label: "Medium",
        description: "1280x720 at 30 fps",
        width: 1280,
        height: 720,
        fps: 30,
        quality: 85,
    },
    QualityPreset {
        name: "high",
        label: "High",
        description: "1920x1080 at 30 fps",
        width: 1920,
        height: 1080,
        fps: 30,
        quality: 90,
    },
    QualityPreset {
        name: "ultra",
        label: "Ultra (4K)",
        description: "3840x2160 at 15 fps, MJPEG device mode",
        width: 3840,
        height: 2160,
        fps: 15,
        quality: 95,
    },
];

/// Look up a preset by name (case-insensitive).
pub fn find_preset(name: &str) -> Option<&'static QualityPreset> {
    QUALITY_PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Preset whose settings equal `settings`, if any.
pub fn preset_for(settings: &VideoSettings) -> Option<&'static QualityPreset> {
    QUALITY_PRESETS.iter().find(|p| p.settings() == *settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> VideoSettings {
        VideoSettings {
            width: 640,
            height: 480,
            fps: 30,
            quality: 85,
        }
    }

    #[test]
    fn test_high_resolution_mode_requires_both_axes() {
        assert_eq!(VideoMode::for_resolution(3840, 2160), VideoMode::HighResolution);
        assert_eq!(VideoMode::for_resolution(4096, 2160), VideoMode::HighResolution);
        assert_eq!(VideoMode::for_resolution(3840, 1080), VideoMode::Standard);
        assert_eq!(VideoMode::for_resolution(1920, 2160), VideoMode::Standard);
        assert_eq!(VideoMode::for_resolution(1280, 720), VideoMode::Standard);
    }

    #[test]
    fn test_modes_use_different_device_configuration() {
        let high = VideoMode::HighResolution;
        let standard = VideoMode::Standard;
        assert_ne!(high.source_caps(), standard.source_caps());
        assert_eq!(high.decoder(), Some("jpegdec"));
        assert_eq!(standard.decoder(), None);
        assert_eq!(high.buffer_size(), 1);
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let update = VideoSettingsUpdate {
            fps: Some(15),
            ..Default::default()
        };
        let merged = base().merged(&update);
        assert_eq!(merged.width, 640);
        assert_eq!(merged.fps, 15);
        assert_eq!(merged.quality, 85);
    }

    #[test]
    fn test_validate_rejects_bad_quality() {
        let mut settings = base();
        settings.quality = 0;
        assert!(settings.validate().is_err());
        settings.quality = 101;
        assert!(settings.validate().is_err());
        settings.quality = 100;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_find_preset_case_insensitive() {
        assert_eq!(find_preset("HIGH").map(|p| p.width), Some(1920));
        assert!(find_preset("unknown").is_none());
    }

    #[test]
    fn test_ultra_preset_is_high_resolution() {
        let ultra = find_preset("ultra").map(|p| p.settings().mode());
        assert_eq!(ultra, Some(VideoMode::HighResolution));
    }

    #[test]
    fn test_preset_for_settings() {
        let medium = find_preset("medium").map(|p| p.settings());
        assert_eq!(medium.and_then(|s| preset_for(&s)).map(|p| p.name), Some("medium"));
        assert!(preset_for(&base()).is_none());
    }
}
