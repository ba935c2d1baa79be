//! Process-wide monitoring state.
//!
//! Holds the shared camera, viewer sessions, the latest alignment status and
//! the alert settings. Status and distance are a single broadcast value: the
//! last processed frame from any session wins.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::camera::SharedCamera;
use crate::capture_store::CaptureStore;
use crate::frame_processor::AlignmentStatus;

/// A browser viewer.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub is_monitoring: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: Instant,
}

/// Detection parameters adjustable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionTuning {
    pub tolerance_px: u32,
    pub confidence_threshold: f32,
    pub target_distance_cm: f32,
}

/// Latest published alignment result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: AlignmentStatus,
    pub distance_cm: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: AlignmentStatus::Waiting,
            distance_cm: 0,
            updated_at: None,
        }
    }
}

/// Shared context for every session loop and request handler.
pub struct MonitoringState {
    camera: Arc<SharedCamera>,
    captures: CaptureStore,
    sessions: RwLock<HashMap<String, Session>>,
    status: RwLock<StatusSnapshot>,
    tuning: RwLock<DetectionTuning>,
    alert_enabled: AtomicBool,
    email: RwLock<Option<String>>,
    last_alert: Mutex<Option<Instant>>,
}

impl MonitoringState {
    pub fn new(camera: Arc<SharedCamera>, captures: CaptureStore, tuning: DetectionTuning) -> Self {
        Self {
            camera,
            captures,
            sessions: RwLock::new(HashMap::new()),
            status: RwLock::new(StatusSnapshot::default()),
            tuning: RwLock::new(tuning),
            alert_enabled: AtomicBool::new(false),
            email: RwLock::new(None),
            last_alert: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &Arc<SharedCamera> {
        &self.camera
    }

    pub fn captures(&self) -> &CaptureStore {
        &self.captures
    }

    /// Look up `id`, creating the session and registering it with the camera
    /// on first reference. Returns true when the session was created.
    ///
    /// A camera open failure is logged; the session still exists and the
    /// streaming loop retries the camera. Camera registration happens under
    /// the sessions lock so a concurrent reap cannot interleave with it.
    pub fn get_or_create_session(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(id) {
            session.last_active = Instant::now();
            return false;
        }
        sessions.insert(
            id.to_string(),
            Session {
                id: id.to_string(),
                is_monitoring: false,
                created_at: Utc::now(),
                last_active: Instant::now(),
            },
        );

        info!(session_id = %id, "Session created");
        if let Err(e) = self.camera.add_session(id) {
            warn!(session_id = %id, error = %e, "Camera unavailable for new session");
        }
        true
    }

    pub fn session_exists(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Refresh `last_active`. Returns false for unknown sessions.
    pub fn touch_session(&self, id: &str) -> bool {
        match self.sessions.write().get_mut(id) {
            Some(session) => {
                session.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Set the monitoring flag. Returns false for unknown sessions.
    pub fn set_monitoring(&self, id: &str, monitoring: bool) -> bool {
        match self.sessions.write().get_mut(id) {
            Some(session) => {
                session.is_monitoring = monitoring;
                session.last_active = Instant::now();
                info!(session_id = %id, monitoring, "Monitoring state changed");
                true
            }
            None => false,
        }
    }

    /// Monitoring flag of `id`, or `None` once the session is gone.
    pub fn session_monitoring(&self, id: &str) -> Option<bool> {
        self.sessions.read().get(id).map(|s| s.is_monitoring)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// True when any session is monitoring.
    pub fn any_monitoring(&self) -> bool {
        self.sessions.read().values().any(|s| s.is_monitoring)
    }

    /// Reap sessions idle for longer than `timeout`.
    pub fn cleanup_inactive_sessions(&self, timeout: Duration) -> Vec<String> {
        self.reap_sessions_at(Instant::now(), timeout)
    }

    /// Reap sessions whose `last_active` is more than `timeout` before `now`,
    /// deregistering each from the camera once.
    ///
    /// Lock order is sessions then camera, matching session creation.
    pub fn reap_sessions_at(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_active) > timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            sessions.remove(id);
            self.camera.remove_session(id);
            info!(session_id = %id, "Inactive session reaped");
        }
        expired
    }

    /// Drop every session, for shutdown.
    pub fn clear_sessions(&self) {
        let mut sessions = self.sessions.write();
        for (id, _) in sessions.drain() {
            self.camera.remove_session(&id);
        }
    }

    pub fn set_status(&self, status: AlignmentStatus, distance_cm: u32) {
        *self.status.write() = StatusSnapshot {
            status,
            distance_cm,
            updated_at: Some(Utc::now()),
        };
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        *self.status.read()
    }

    pub fn tuning(&self) -> DetectionTuning {
        *self.tuning.read()
    }

    pub fn set_tuning(&self, tuning: DetectionTuning) {
        *self.tuning.write() = tuning;
    }

    pub fn alert_enabled(&self) -> bool {
        self.alert_enabled.load(Ordering::SeqCst)
    }

    pub fn set_alert_enabled(&self, enabled: bool) {
        self.alert_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn email(&self) -> Option<String> {
        self.email.read().clone()
    }

    pub fn set_email(&self, email: Option<String>) {
        *self.email.write() = email;
    }

    /// Claim the automatic alert slot if `cooldown` has passed since the last
    /// claim. At most one caller wins per cooldown window.
    pub fn try_claim_alert_slot(&self, cooldown: Duration) -> bool {
        let mut last = self.last_alert.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.saturating_duration_since(at) < cooldown => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::tests::{fake_camera, FakeBackend};
    use crate::config::CaptureConfig;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    pub fn create_test_state(dir: &TempDir) -> (MonitoringState, Arc<FakeBackend>) {
        let (camera, backend) = fake_camera(vec![0]);
        let captures = CaptureStore::new(&CaptureConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let tuning = DetectionTuning {
            tolerance_px: 50,
            confidence_threshold: 0.6,
            target_distance_cm: 10.0,
        };
        (
            MonitoringState::new(Arc::new(camera), captures, tuning),
            backend,
        )
    }

    #[test]
    fn test_session_created_once() {
        let dir = TempDir::new().unwrap();
        let (state, backend) = create_test_state(&dir);
        assert!(state.get_or_create_session("a"));
        assert!(!state.get_or_create_session("a"));
        assert_eq!(state.session_count(), 1);
        assert!(state.camera().is_active());
        assert_eq!(backend.controls.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reaping_deregisters_exactly_once() {
        let dir = TempDir::new().unwrap();
        let (state, backend) = create_test_state(&dir);
        state.get_or_create_session("stale");
        let timeout = Duration::from_secs(60);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(state.reap_sessions_at(later, timeout), vec!["stale".to_string()]);
        assert!(state.reap_sessions_at(later, timeout).is_empty());

        assert!(!state.session_exists("stale"));
        assert_eq!(state.camera().session_count(), 0);
        assert!(!state.camera().is_active());
        assert_eq!(backend.controls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reap_racing_recreate_keeps_camera_registered() {
        let dir = TempDir::new().unwrap();
        let (state, _backend) = create_test_state(&dir);
        let later = Instant::now() + Duration::from_secs(3600);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..500 {
                    state.reap_sessions_at(later, Duration::from_secs(60));
                }
            });
            scope.spawn(|| {
                for _ in 0..500 {
                    state.get_or_create_session("viewer");
                }
            });
        });

        state.get_or_create_session("viewer");
        assert_eq!(state.session_count(), 1);
        assert_eq!(state.camera().session_count(), 1);
        assert!(state.camera().is_active());
    }

    #[test]
    fn test_active_sessions_survive_reaping() {
        let dir = TempDir::new().unwrap();
        let (state, _backend) = create_test_state(&dir);
        state.get_or_create_session("fresh");
        let reaped = state.cleanup_inactive_sessions(Duration::from_secs(60));
        assert!(reaped.is_empty());
        assert!(state.session_exists("fresh"));
    }

    #[test]
    fn test_monitoring_flag_per_session() {
        let dir = TempDir::new().unwrap();
        let (state, _backend) = create_test_state(&dir);
        state.get_or_create_session("a");
        state.get_or_create_session("b");
        assert!(!state.any_monitoring());

        assert!(state.set_monitoring("a", true));
        assert_eq!(state.session_monitoring("a"), Some(true));
        assert_eq!(state.session_monitoring("b"), Some(false));
        assert!(state.any_monitoring());

        assert!(!state.set_monitoring("missing", true));
        assert_eq!(state.session_monitoring("missing"), None);
    }

    #[test]
    fn test_status_is_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let (state, _backend) = create_test_state(&dir);
        assert_eq!(state.status_snapshot().status, AlignmentStatus::Waiting);
        state.set_status(AlignmentStatus::TooHigh, 12);
        state.set_status(AlignmentStatus::Normal, 1);
        let snapshot = state.status_snapshot();
        assert_eq!(snapshot.status, AlignmentStatus::Normal);
        assert_eq!(snapshot.distance_cm, 1);
        assert!(snapshot.updated_at.is_some());
    }

    #[test]
    fn test_alert_slot_respects_cooldown() {
        let dir = TempDir::new().unwrap();
        let (state, _backend) = create_test_state(&dir);
        assert!(state.try_claim_alert_slot(Duration::from_secs(300)));
        assert!(!state.try_claim_alert_slot(Duration::from_secs(300)));
        assert!(state.try_claim_alert_slot(Duration::ZERO));
    }

    #[test]
    fn test_clear_sessions_releases_camera() {
        let dir = TempDir::new().unwrap();
        let (state, _backend) = create_test_state(&dir);
        state.get_or_create_session("a");
        state.get_or_create_session("b");
        state.clear_sessions();
        assert_eq!(state.session_count(), 0);
        assert!(!state.camera().is_active());
    }
}
