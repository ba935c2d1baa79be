//! Monitor operations exposed to the HTTP layer.
//!
//! Every operation returns a `Result` with a [`ServiceError`] that the API
//! maps to a structured error response; nothing here panics across the
//! boundary.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::camera::{CameraError, CameraInfo};
use crate::capture_store::{CaptureError, CaptureRecord};
use crate::config::MonitorConfig;
use crate::frame_processor::{encode_jpeg, AlignmentStatus, FrameProcessor};
use crate::monitoring_state::{DetectionTuning, MonitoringState};
use crate::notifier::{validate_email, AlertMessage, AlertNotifier, NotifyError};
use crate::settings_store::{keys, SettingsStore};
use crate::video_settings::{
    find_preset, preset_for, QualityPreset, VideoSettings, VideoSettingsUpdate, QUALITY_PRESETS,
};

const MAX_TOLERANCE_PX: u32 = 10_000;

/// Errors returned by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("{0}")]
    Validation(String),

    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Email alerts are disabled")]
    NotifierUnavailable,

    #[error("Alert delivery failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::UnknownSession(_) => "UNKNOWN_SESSION",
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::CameraUnavailable(_) => "CAMERA_UNAVAILABLE",
            ServiceError::Camera(CameraError::InvalidSettings(_)) => "VALIDATION_ERROR",
            ServiceError::Camera(_) => "CAMERA_ERROR",
            ServiceError::Capture(_) => "CAPTURE_FAILED",
            ServiceError::NotifierUnavailable => "NOTIFIER_UNAVAILABLE",
            ServiceError::Notify(NotifyError::InvalidAddress(_)) => "VALIDATION_ERROR",
            ServiceError::Notify(_) => "ALERT_FAILED",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Options the service takes from configuration.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub auto_capture: bool,
    pub alert_subject: String,
    pub alert_cooldown: Duration,
    pub session_timeout: Duration,
}

impl From<&MonitorConfig> for ServiceOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            auto_capture: config.capture.auto_capture,
            alert_subject: config.email.subject.clone(),
            alert_cooldown: config.email.alert_cooldown(),
            session_timeout: config.session.timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created: bool,
    pub is_monitoring: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: AlignmentStatus,
    pub message: &'static str,
    pub distance_cm: u32,
    pub is_monitoring: bool,
    pub alert_enabled: bool,
    pub camera_active: bool,
    pub detector_loaded: bool,
    pub session_count: usize,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Partial tuning update; unset fields keep their value.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TuningUpdate {
    pub tolerance_px: Option<u32>,
    pub confidence_threshold: Option<f32>,
    pub target_distance_cm: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresetList {
    pub presets: &'static [QualityPreset],
    pub current: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityInfo {
    pub preset_name: Option<&'static str>,
    pub preset: Option<QualityPreset>,
    pub settings: VideoSettings,
    pub camera_info: CameraInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityChange {
    pub preset: QualityPreset,
    /// False when the camera was idle and the preset applies on next open
    pub applied: bool,
    pub message: String,
}

/// One processed and encoded frame.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub jpeg: Vec<u8>,
    pub status: AlignmentStatus,
    pub distance_cm: u32,
}

/// Owns the wiring between state, processor, persistence and alerting.
pub struct MonitorService {
    state: Arc<MonitoringState>,
    processor: Arc<FrameProcessor>,
    settings: Arc<dyn SettingsStore>,
    notifier: Arc<dyn AlertNotifier>,
    options: ServiceOptions,
}

impl MonitorService {
    pub fn new(
        state: Arc<MonitoringState>,
        processor: Arc<FrameProcessor>,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn AlertNotifier>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            state,
            processor,
            settings,
            notifier,
            options,
        }
    }

    pub fn state(&self) -> &Arc<MonitoringState> {
        &self.state
    }

    /// Restore email, tolerance, quality preset and alert flag from storage.
    /// Unreadable or invalid values are logged and skipped.
    pub async fn load_persisted_settings(&self) {
        match self.settings.get_setting(keys::EMAIL).await {
            Ok(Some(email)) => match validate_email(&email) {
                Ok(_) => self.state.set_email(Some(email.trim().to_string())),
                Err(e) => warn!(error = %e, "Ignoring stored email"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load stored email"),
        }

        match self.settings.get_setting(keys::TOLERANCE).await {
            Ok(Some(raw)) => match raw.parse::<u32>() {
                Ok(tolerance_px) if tolerance_px <= MAX_TOLERANCE_PX => {
                    let mut tuning = self.state.tuning();
                    tuning.tolerance_px = tolerance_px;
                    self.state.set_tuning(tuning);
                }
                _ => warn!(value = %raw, "Ignoring stored tolerance"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load stored tolerance"),
        }

        match self.settings.get_setting(keys::ALERT_ENABLED).await {
            Ok(Some(raw)) => self.state.set_alert_enabled(raw == "true"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load alert flag"),
        }

        match self.settings.get_setting(keys::QUALITY_PRESET).await {
            Ok(Some(name)) => match find_preset(&name) {
                Some(preset) => {
                    let update = VideoSettingsUpdate::from(preset.settings());
                    if let Err(e) = self.state.camera().update_settings(&update) {
                        warn!(preset = preset.name, error = %e, "Stored preset not applied");
                    }
                }
                None => warn!(preset = %name, "Ignoring unknown stored preset"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load stored preset"),
        }

        info!(
            email_saved = self.state.email().is_some(),
            alert_enabled = self.state.alert_enabled(),
            tolerance_px = self.state.tuning().tolerance_px,
            "Persisted settings loaded"
        );
    }

    /// Look up `requested` (creating it) or issue a fresh session id.
    pub fn open_session(&self, requested: Option<&str>) -> SessionInfo {
        let session_id = requested
            .map(str::trim)
            .filter(|id| is_valid_session_id(id))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let created = self.state.get_or_create_session(&session_id);
        SessionInfo {
            is_monitoring: self.state.session_monitoring(&session_id).unwrap_or(false),
            session_id,
            created,
        }
    }

    /// Keep `session_id` alive, recreating it if it was reaped.
    pub fn heartbeat(&self, session_id: &str) -> SessionInfo {
        let created = self.state.get_or_create_session(session_id);
        self.state.touch_session(session_id);
        SessionInfo {
            session_id: session_id.to_string(),
            created,
            is_monitoring: self.state.session_monitoring(session_id).unwrap_or(false),
        }
    }

    pub fn start_monitoring(&self, session_id: &str) -> SessionInfo {
        self.state.get_or_create_session(session_id);
        self.state.set_monitoring(session_id, true);
        SessionInfo {
            session_id: session_id.to_string(),
            created: false,
            is_monitoring: true,
        }
    }

    pub fn stop_monitoring(&self, session_id: &str) -> Result<SessionInfo, ServiceError> {
        if !self.state.set_monitoring(session_id, false) {
            return Err(ServiceError::UnknownSession(session_id.to_string()));
        }
        Ok(SessionInfo {
            session_id: session_id.to_string(),
            created: false,
            is_monitoring: false,
        })
    }

    pub fn toggle_monitoring(&self, session_id: &str) -> SessionInfo {
        self.state.get_or_create_session(session_id);
        let next = !self.state.session_monitoring(session_id).unwrap_or(false);
        self.state.set_monitoring(session_id, next);
        SessionInfo {
            session_id: session_id.to_string(),
            created: false,
            is_monitoring: next,
        }
    }

    /// Reap sessions idle past the configured timeout.
    pub fn reap_inactive_sessions(&self) -> Vec<String> {
        self.state.cleanup_inactive_sessions(self.options.session_timeout)
    }

    pub fn status(&self) -> StatusReport {
        let snapshot = self.state.status_snapshot();
        StatusReport {
            status: snapshot.status,
            message: snapshot.status.message(),
            distance_cm: snapshot.distance_cm,
            is_monitoring: self.state.any_monitoring(),
            alert_enabled: self.state.alert_enabled(),
            camera_active: self.state.camera().is_active(),
            detector_loaded: self.processor.has_detector(),
            session_count: self.state.session_count(),
            updated_at: snapshot.updated_at,
        }
    }

    pub fn captures(&self) -> Vec<CaptureRecord> {
        self.state.captures().recent()
    }

    /// Process the current frame and save it as a manual capture. Blocking.
    pub fn capture_current(&self) -> Result<CaptureRecord, ServiceError> {
        let camera = self.state.camera();
        if !camera.is_active() {
            return Err(ServiceError::CameraUnavailable(
                "camera is not active".to_string(),
            ));
        }
        let frame = camera.get_frame()?.ok_or_else(|| {
            ServiceError::CameraUnavailable("no frame available".to_string())
        })?;

        let processed = self.processor.process(frame.as_ref().clone(), &self.state);
        let quality = camera.settings().quality;
        let record = self
            .state
            .captures()
            .add_capture(
                &processed.image,
                true,
                processed.status,
                processed.distance_cm,
                quality,
            )?
            .ok_or_else(|| ServiceError::Internal("manual capture was skipped".to_string()))?;

        info!(file = %record.file_name, "Manual capture completed");
        Ok(record)
    }

    /// Validate and apply a tuning update; the tolerance is persisted.
    pub async fn update_tuning(&self, update: TuningUpdate) -> Result<DetectionTuning, ServiceError> {
        if update.tolerance_px.is_none()
            && update.confidence_threshold.is_none()
            && update.target_distance_cm.is_none()
        {
            return Err(ServiceError::Validation("No tuning values supplied".to_string()));
        }

        let mut tuning = self.state.tuning();
        if let Some(tolerance_px) = update.tolerance_px {
            if tolerance_px > MAX_TOLERANCE_PX {
                return Err(ServiceError::Validation(format!(
                    "Tolerance must be at most {} px",
                    MAX_TOLERANCE_PX
                )));
            }
            tuning.tolerance_px = tolerance_px;
        }
        if let Some(threshold) = update.confidence_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(ServiceError::Validation(
                    "Confidence threshold must be in (0, 1]".to_string(),
                ));
            }
            tuning.confidence_threshold = threshold;
        }
        if let Some(distance) = update.target_distance_cm {
            if !distance.is_finite() || distance < 0.0 {
                return Err(ServiceError::Validation(
                    "Target distance must be a non-negative number".to_string(),
                ));
            }
            tuning.target_distance_cm = distance;
        }

        self.state.set_tuning(tuning);
        info!(
            tolerance_px = tuning.tolerance_px,
            confidence_threshold = tuning.confidence_threshold,
            target_distance_cm = tuning.target_distance_cm,
            "Detection tuning updated"
        );

        if update.tolerance_px.is_some() {
            self.persist(keys::TOLERANCE, &tuning.tolerance_px.to_string())
                .await;
        }
        Ok(tuning)
    }

    pub fn quality_presets(&self) -> PresetList {
        PresetList {
            presets: QUALITY_PRESETS,
            current: preset_for(&self.state.camera().settings()).map(|p| p.name),
        }
    }

    pub fn current_quality(&self) -> QualityInfo {
        let settings = self.state.camera().settings();
        let preset = preset_for(&settings);
        QualityInfo {
            preset_name: preset.map(|p| p.name),
            preset: preset.copied(),
            settings,
            camera_info: self.state.camera().camera_info(),
        }
    }

    /// Apply a named preset to the camera, rolling back on failure.
    pub async fn set_quality_preset(&self, name: &str) -> Result<QualityChange, ServiceError> {
        let preset = *find_preset(name)
            .ok_or_else(|| ServiceError::Validation(format!("Unknown quality preset '{}'", name)))?;

        let camera = Arc::clone(self.state.camera());
        let was_active = camera.is_active();
        let update = VideoSettingsUpdate::from(preset.settings());
        tokio::task::spawn_blocking(move || camera.update_settings(&update))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))??;

        self.persist(keys::QUALITY_PRESET, preset.name).await;

        let message = if was_active {
            format!("Quality changed to '{}'", preset.label)
        } else {
            format!("Quality set to '{}', applied when the camera next opens", preset.label)
        };
        info!(preset = preset.name, applied = was_active, "Quality preset set");
        Ok(QualityChange {
            preset,
            applied: was_active,
            message,
        })
    }

    pub async fn save_email(&self, email: &str) -> Result<String, ServiceError> {
        let address = validate_email(email)?.to_string();
        self.state.set_email(Some(address.clone()));
        self.persist(keys::EMAIL, &address).await;
        info!(email = %address, "Alert email saved");
        Ok(address)
    }

    pub fn email(&self) -> Option<String> {
        self.state.email()
    }

    /// Flip the automatic alert flag and persist it.
    pub async fn toggle_alerts(&self) -> bool {
        let enabled = !self.state.alert_enabled();
        self.state.set_alert_enabled(enabled);
        self.persist(keys::ALERT_ENABLED, if enabled { "true" } else { "false" })
            .await;
        info!(alert_enabled = enabled, "Automatic alerts toggled");
        enabled
    }

    /// Email the current status to the saved address.
    pub async fn send_alert_now(&self) -> Result<(), ServiceError> {
        let message = self.compose_alert()?;
        self.notifier.send_alert(&message).await?;
        info!(to = %message.to, "Alert sent");
        Ok(())
    }

    /// Send an automatic alert in the background if alerts are enabled, the
    /// status is abnormal and the cooldown has passed.
    pub fn maybe_auto_alert(self: &Arc<Self>, status: AlignmentStatus) {
        if !self.state.alert_enabled() || !status.is_abnormal() || !self.notifier.is_enabled() {
            return;
        }
        if self.state.email().is_none() {
            return;
        }
        if !self.state.try_claim_alert_slot(self.options.alert_cooldown) {
            return;
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.send_alert_now().await {
                error!(error = %e, "Automatic alert failed");
            }
        });
    }

    /// Ensure the camera is open for the registered sessions.
    pub fn ensure_camera(&self) -> Result<(), ServiceError> {
        self.state.camera().start_capture()?;
        Ok(())
    }

    /// Read, process, optionally auto-capture and encode one frame. Blocking.
    ///
    /// Returns `Ok(None)` when the camera has no frame to give.
    pub fn process_tick(&self) -> Result<Option<TickOutcome>, ServiceError> {
        let camera = self.state.camera();
        let Some(frame) = camera.get_frame()? else {
            return Ok(None);
        };
        let quality = camera.settings().quality;

        let processed = self.processor.process(frame.as_ref().clone(), &self.state);

        if self.options.auto_capture {
            if let Err(e) = self.state.captures().add_capture(
                &processed.image,
                false,
                processed.status,
                processed.distance_cm,
                quality,
            ) {
                warn!(error = %e, "Automatic capture failed");
            }
        }

        let jpeg = encode_jpeg(&processed.image, quality)
            .map_err(|e| ServiceError::Internal(format!("JPEG encoding failed: {}", e)))?;
        debug!(bytes = jpeg.len(), status = %processed.status, "Frame encoded");

        Ok(Some(TickOutcome {
            jpeg,
            status: processed.status,
            distance_cm: processed.distance_cm,
        }))
    }

    fn compose_alert(&self) -> Result<AlertMessage, ServiceError> {
        let to = self.state.email().ok_or_else(|| {
            ServiceError::Validation("Save an alert email address first".to_string())
        })?;
        if !self.notifier.is_enabled() {
            return Err(ServiceError::NotifierUnavailable);
        }

        let snapshot = self.state.status_snapshot();
        Ok(AlertMessage {
            to,
            subject: self.options.alert_subject.clone(),
            body: format!(
                "Abnormal state detected\nStatus: {}\nDistance: {} cm",
                snapshot.status.message(),
                snapshot.distance_cm
            ),
            attachment: self.state.captures().latest_file(),
        })
    }

    async fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.settings.save_setting(key, value).await {
            warn!(key, error = %e, "Failed to persist setting");
        }
    }
}

pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
