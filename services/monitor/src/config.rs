//! Configuration management for the laser monitor service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::video_settings::VideoSettings;

/// Main configuration for the monitor service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Camera device configuration
    #[serde(default)]
    pub camera: CameraConfig,

    /// Person detection and alignment configuration
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Capture retention configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Viewer session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Streaming loop timing
    #[serde(default)]
    pub stream: StreamConfig,

    /// Alert email configuration
    #[serde(default)]
    pub email: EmailConfig,

    /// Settings database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Prometheus exporter port (0 disables the exporter)
    #[serde(default)]
    pub metrics_port: u16,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Which capture backend opens the physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraBackendKind {
    /// V4L2 device through a GStreamer pipeline (feature `camera-gstreamer`)
    Gstreamer,
    /// Synthetic moving test pattern
    TestPattern,
}

/// Camera device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Capture backend
    #[serde(default = "default_camera_backend")]
    pub backend: CameraBackendKind,

    /// Preferred device index (/dev/video{N})
    #[serde(default)]
    pub device_index: u32,

    /// Requested frame width
    #[serde(default = "default_camera_width")]
    pub width: u32,

    /// Requested frame height
    #[serde(default = "default_camera_height")]
    pub height: u32,

    /// Requested frames per second
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// JPEG quality used for streaming and captures (1-100)
    #[serde(default = "default_camera_quality")]
    pub quality: u8,

    /// Named quality preset applied over width/height/fps/quality
    #[serde(default)]
    pub quality_preset: Option<String>,

    /// Timeout for the device pipeline to reach the playing state
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Timeout for a single frame read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Consecutive read failures before the device handle is released
    #[serde(default = "default_max_read_failures")]
    pub max_read_failures: u32,
}

/// Which detection backend to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorBackendKind {
    /// YOLOv8 ONNX export run by tract (feature `detector-tract`)
    Tract,
    /// No detector; frames only get a crosshair
    None,
}

/// Person detection and alignment configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Detection backend
    #[serde(default = "default_detector_backend")]
    pub backend: DetectorBackendKind,

    /// Path to the ONNX model
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Square model input size in pixels
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Minimum confidence for a detection to qualify (exclusive)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// IoU threshold for non-maximum suppression
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Class id of the tracked subject (COCO person = 0)
    #[serde(default)]
    pub target_class_id: u32,

    /// Per-axis alignment tolerance in pixels
    #[serde(default = "default_tolerance_px")]
    pub tolerance_px: u32,

    /// Target point offset below the top of the subject, in cm
    #[serde(default = "default_target_distance_cm")]
    pub target_distance_cm: f32,

    /// Mirror frames horizontally before detection
    #[serde(default = "default_true")]
    pub mirror: bool,

    /// TTF font for overlay text; shapes only when unset
    #[serde(default)]
    pub font_path: Option<PathBuf>,
}

/// Capture retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Directory receiving capture files
    #[serde(default = "default_capture_dir")]
    pub directory: PathBuf,

    /// URL prefix the capture directory is served under
    #[serde(default = "default_capture_url_prefix")]
    pub url_prefix: String,

    /// Minimum seconds between automatic captures
    #[serde(default = "default_capture_interval")]
    pub interval_secs: u64,

    /// Recent captures kept in memory
    #[serde(default = "default_max_captures")]
    pub max_captures: usize,

    /// Capture files kept on disk
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Persist interval-triggered captures while monitoring
    #[serde(default = "default_true")]
    pub auto_capture: bool,
}

/// Viewer session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds without a heartbeat before a session is reaped
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    /// Seconds between reaper passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Streaming loop timing.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Poll interval while a session is not monitoring
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Fixed delay before retrying to open the camera
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Delay after a failed frame
    #[serde(default = "default_error_delay_ms")]
    pub error_delay_ms: u64,

    /// Parts buffered per client before backpressure
    #[serde(default = "default_stream_buffer")]
    pub buffer_frames: usize,
}

/// Alert email configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// SMTP relay host
    #[serde(default = "default_smtp_server")]
    pub smtp_server: String,

    /// SMTP submission port (STARTTLS)
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Sender address; alerts are disabled when empty
    #[serde(default)]
    pub sender_email: String,

    /// Sender password
    #[serde(default)]
    pub sender_password: String,

    /// Subject line for alert emails
    #[serde(default = "default_email_subject")]
    pub subject: String,

    /// Minimum seconds between automatic alerts
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_secs: u64,
}

/// Settings database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_service_name() -> String {
    "laser-monitor".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_camera_backend() -> CameraBackendKind {
    if cfg!(feature = "camera-gstreamer") {
        CameraBackendKind::Gstreamer
    } else {
        CameraBackendKind::TestPattern
    }
}
fn default_camera_width() -> u32 {
    640
}
fn default_camera_height() -> u32 {
    480
}
fn default_camera_fps() -> u32 {
    30
}
fn default_camera_quality() -> u8 {
    85
}
fn default_open_timeout_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_max_read_failures() -> u32 {
    5
}
fn default_detector_backend() -> DetectorBackendKind {
    if cfg!(feature = "detector-tract") {
        DetectorBackendKind::Tract
    } else {
        DetectorBackendKind::None
    }
}
fn default_model_path() -> PathBuf {
    PathBuf::from("models/yolov8n.onnx")
}
fn default_input_size() -> u32 {
    640
}
fn default_confidence_threshold() -> f32 {
    0.6
}
fn default_iou_threshold() -> f32 {
    0.45
}
fn default_tolerance_px() -> u32 {
    50
}
fn default_target_distance_cm() -> f32 {
    10.0
}
fn default_true() -> bool {
    true
}
fn default_capture_dir() -> PathBuf {
    PathBuf::from("static/captures")
}
fn default_capture_url_prefix() -> String {
    "/captures".to_string()
}
fn default_capture_interval() -> u64 {
    60
}
fn default_max_captures() -> usize {
    10
}
fn default_max_files() -> usize {
    20
}
fn default_session_timeout() -> u64 {
    60
}
fn default_cleanup_interval() -> u64 {
    10
}
fn default_idle_poll_ms() -> u64 {
    100
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_error_delay_ms() -> u64 {
    1000
}
fn default_stream_buffer() -> usize {
    2
}
fn default_smtp_server() -> String {
    "smtp.gmail.com".to_string()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_email_subject() -> String {
    "[Laser Monitor] Alert".to_string()
}
fn default_alert_cooldown() -> u64 {
    300
}
fn default_database_url() -> String {
    "sqlite://data/settings.db".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_camera_backend(),
            device_index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            fps: default_camera_fps(),
            quality: default_camera_quality(),
            quality_preset: None,
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_read_failures: default_max_read_failures(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            backend: default_detector_backend(),
            model_path: default_model_path(),
            input_size: default_input_size(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            target_class_id: 0,
            tolerance_px: default_tolerance_px(),
            target_distance_cm: default_target_distance_cm(),
            mirror: true,
            font_path: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            directory: default_capture_dir(),
            url_prefix: default_capture_url_prefix(),
            interval_secs: default_capture_interval(),
            max_captures: default_max_captures(),
            max_files: default_max_files(),
            auto_capture: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: default_idle_poll_ms(),
            retry_delay_secs: default_retry_delay_secs(),
            error_delay_ms: default_error_delay_ms(),
            buffer_frames: default_stream_buffer(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: default_smtp_server(),
            smtp_port: default_smtp_port(),
            sender_email: String::new(),
            sender_password: String::new(),
            subject: default_email_subject(),
            alert_cooldown_secs: default_alert_cooldown(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with MONITOR_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. MONITOR__CAMERA__DEVICE_INDEX=1
            .add_source(
                Environment::with_prefix("MONITOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("MONITOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.host.is_empty() {
            return Err(ConfigValidationError::MissingField("server.host".to_string()));
        }

        self.camera_settings()
            .validate()
            .map_err(|message| ConfigValidationError::InvalidValue {
                field: "camera".to_string(),
                message,
            })?;

        if let Some(name) = &self.camera.quality_preset {
            if crate::video_settings::find_preset(name).is_none() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "camera.quality_preset".to_string(),
                    message: format!("unknown preset '{}'", name),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.confidence_threshold".to_string(),
                message: "Must be between 0 and 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.iou_threshold".to_string(),
                message: "Must be between 0 and 1".to_string(),
            });
        }

        if self.detection.input_size == 0 || self.detection.input_size % 32 != 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.input_size".to_string(),
                message: "Must be a positive multiple of 32".to_string(),
            });
        }

        if !self.detection.target_distance_cm.is_finite() || self.detection.target_distance_cm < 0.0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.target_distance_cm".to_string(),
                message: "Must be a non-negative number".to_string(),
            });
        }

        if self.capture.max_captures == 0 || self.capture.max_files == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.max_captures/max_files".to_string(),
                message: "Retention bounds must be greater than 0".to_string(),
            });
        }

        if !self.capture.url_prefix.starts_with('/') || self.capture.url_prefix.len() < 2 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.url_prefix".to_string(),
                message: "Must start with '/' and name a path".to_string(),
            });
        }

        if self.session.timeout_secs == 0 || self.session.cleanup_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "session".to_string(),
                message: "Timeouts must be greater than 0".to_string(),
            });
        }

        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        Ok(())
    }

    /// Initial camera settings: the configured preset if any, else the raw fields.
    pub fn camera_settings(&self) -> VideoSettings {
        self.camera
            .quality_preset
            .as_deref()
            .and_then(crate::video_settings::find_preset)
            .map(|preset| preset.settings())
            .unwrap_or(VideoSettings {
                width: self.camera.width,
                height: self.camera.height,
                fps: self.camera.fps,
                quality: self.camera.quality,
            })
    }
}

impl CameraConfig {
    /// Get open timeout as Duration.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Get read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl StreamConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }
}

impl EmailConfig {
    /// Whether SMTP credentials are present.
    pub fn is_configured(&self) -> bool {
        !self.sender_email.is_empty() && !self.sender_password.is_empty()
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_retention_and_detection_values() {
        let config = MonitorConfig::default();
        assert_eq!(config.capture.interval_secs, 60);
        assert_eq!(config.capture.max_captures, 10);
        assert_eq!(config.capture.max_files, 20);
        assert_eq!(config.session.timeout_secs, 60);
        assert_eq!(config.detection.tolerance_px, 50);
        assert_eq!(config.detection.confidence_threshold, 0.6);
        assert_eq!(config.email.smtp_port, 587);
    }

    #[test]
    fn test_invalid_camera_dimensions() {
        let mut config = MonitorConfig::default();
        config.camera.width = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_quality_preset() {
        let mut config = MonitorConfig::default();
        config.camera.quality_preset = Some("cinema".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_preset_overrides_camera_fields() {
        let mut config = MonitorConfig::default();
        config.camera.quality_preset = Some("high".to_string());
        let settings = config.camera_settings();
        assert_eq!(settings.width, 1920);
        assert_eq!(settings.height, 1080);
    }

    #[test]
    fn test_confidence_out_of_range() {
        let mut config = MonitorConfig::default();
        config.detection.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut config = MonitorConfig::default();
        config.capture.max_files = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capture_prefix_must_be_a_path() {
        let mut config = MonitorConfig::default();
        config.capture.url_prefix = "/".to_string();
        assert!(config.validate().is_err());
        config.capture.url_prefix = "captures".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_database_url() {
        let mut config = MonitorConfig::default();
        config.database.url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_email_configuration_detection() {
        let mut email = EmailConfig::default();
        assert!(!email.is_configured());
        email.sender_email = "monitor@example.com".to_string();
        email.sender_password = "secret".to_string();
        assert!(email.is_configured());
    }
}
