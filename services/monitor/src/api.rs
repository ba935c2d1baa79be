//! HTTP API: JSON operations, the MJPEG feed and capture files.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, instrument, warn};

use crate::capture_store::CaptureRecord;
use crate::config::{CaptureConfig, ServerConfig};
use crate::service::{is_valid_session_id, MonitorService, ServiceError, TuningUpdate};
use crate::streamer::{mjpeg_content_type, FrameStreamer};

pub const SESSION_COOKIE: &str = "session_id";
pub const SESSION_HEADER: &str = "x-session-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MonitorService>,
    pub streamer: FrameStreamer,
}

/// Successful response: `{"success": true, ...payload}`
#[derive(Debug, Serialize)]
pub struct ApiSuccess<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> ApiSuccess<T> {
    pub fn new(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

/// Handler error carrying the HTTP status and error body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                success: false,
                error: error.into(),
                code: code.to_string(),
            },
        }
    }

    fn missing_session() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "MISSING_SESSION",
            "No session; request /api/v1/session first",
        )
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let status = status_for(&e);
        if status.is_server_error() {
            error!(error = %e, code = e.code(), "Request failed");
        } else {
            warn!(error = %e, code = e.code(), "Request rejected");
        }
        Self::new(status, e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiSuccess<T>>, ApiError>;

/// Unwrap a JSON body, reporting malformed input as a validation error.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        warn!(status = %rejection.status(), error = %rejection.body_text(), "Malformed request body");
        ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", rejection.body_text())
    })
}

/// Run camera-touching work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::from(ServiceError::Internal(e.to_string())))
}

/// HTTP status for a service error.
pub fn status_for(e: &ServiceError) -> StatusCode {
    match e.code() {
        "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
        "UNKNOWN_SESSION" => StatusCode::NOT_FOUND,
        "CAMERA_UNAVAILABLE" | "CAMERA_ERROR" | "NOTIFIER_UNAVAILABLE" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Session id from the `x-session-id` header, else the `session_id` cookie.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    let from_header = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| is_valid_session_id(id));
    if let Some(id) = from_header {
        return Some(id.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|id| is_valid_session_id(id))
        .map(str::to_string)
}

fn require_session(headers: &HeaderMap) -> Result<String, ApiError> {
    session_id_from_headers(headers).ok_or_else(ApiError::missing_session)
}

fn session_cookie(session_id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        SESSION_COOKIE, session_id
    ))
    .ok()
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if !config.cors_enabled {
        return CorsLayer::new();
    }
    if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Create the API router
pub fn create_router(state: AppState, server: &ServerConfig, capture: &CaptureConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/session", get(open_session))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/monitoring/start", post(start_monitoring))
        .route("/api/v1/monitoring/stop", post(stop_monitoring))
        .route("/api/v1/monitoring/toggle", post(toggle_monitoring))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/captures", get(list_captures).post(capture_current))
        .route("/api/v1/tuning", post(update_tuning))
        .route("/api/v1/quality/presets", get(quality_presets))
        .route("/api/v1/quality", get(current_quality).post(set_quality))
        .route("/api/v1/email", get(get_email).post(save_email))
        .route("/api/v1/alerts/toggle", post(toggle_alerts))
        .route("/api/v1/alerts/send", post(send_alert))
        .route("/video_feed", get(video_feed))
        .nest_service(&capture.url_prefix, ServeDir::new(&capture.directory))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(server))
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let camera = state.service.state().camera().camera_info();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "laser-monitor",
        "camera_active": camera.active,
        "camera_backend": camera.backend,
    }))
}

#[instrument(skip_all)]
async fn open_session(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let requested = session_id_from_headers(&headers);
    let service = Arc::clone(&state.service);
    let info = blocking(move || service.open_session(requested.as_deref())).await?;
    let cookie = session_cookie(&info.session_id);

    let mut response = ApiSuccess::new(info).into_response();
    if let Some(cookie) = cookie {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<crate::service::SessionInfo> {
    let id = require_session(&headers)?;
    let service = Arc::clone(&state.service);
    Ok(ApiSuccess::new(blocking(move || service.heartbeat(&id)).await?))
}

async fn start_monitoring(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<crate::service::SessionInfo> {
    let id = require_session(&headers)?;
    let service = Arc::clone(&state.service);
    Ok(ApiSuccess::new(blocking(move || service.start_monitoring(&id)).await?))
}

async fn stop_monitoring(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<crate::service::SessionInfo> {
    let id = require_session(&headers)?;
    Ok(ApiSuccess::new(state.service.stop_monitoring(&id)?))
}

async fn toggle_monitoring(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<crate::service::SessionInfo> {
    let id = require_session(&headers)?;
    let service = Arc::clone(&state.service);
    Ok(ApiSuccess::new(blocking(move || service.toggle_monitoring(&id)).await?))
}

async fn get_status(State(state): State<AppState>) -> ApiResult<crate::service::StatusReport> {
    Ok(ApiSuccess::new(state.service.status()))
}

#[derive(Debug, Serialize)]
struct CaptureList {
    captures: Vec<CaptureRecord>,
}

#[derive(Debug, Serialize)]
struct CaptureCreated {
    capture: CaptureRecord,
}

async fn list_captures(State(state): State<AppState>) -> ApiResult<CaptureList> {
    Ok(ApiSuccess::new(CaptureList {
        captures: state.service.captures(),
    }))
}

#[instrument(skip_all)]
async fn capture_current(State(state): State<AppState>) -> ApiResult<CaptureCreated> {
    let service = Arc::clone(&state.service);
    let capture = blocking(move || service.capture_current()).await??;
    Ok(ApiSuccess::new(CaptureCreated { capture }))
}

#[derive(Debug, Serialize)]
struct TuningResponse {
    tuning: crate::monitoring_state::DetectionTuning,
}

async fn update_tuning(
    State(state): State<AppState>,
    payload: Result<Json<TuningUpdate>, JsonRejection>,
) -> ApiResult<TuningResponse> {
    let update = json_body(payload)?;
    let tuning = state.service.update_tuning(update).await?;
    Ok(ApiSuccess::new(TuningResponse { tuning }))
}

async fn quality_presets(State(state): State<AppState>) -> ApiResult<crate::service::PresetList> {
    Ok(ApiSuccess::new(state.service.quality_presets()))
}

async fn current_quality(State(state): State<AppState>) -> ApiResult<crate::service::QualityInfo> {
    Ok(ApiSuccess::new(state.service.current_quality()))
}

#[derive(Debug, Deserialize)]
struct PresetRequest {
    preset: String,
}

async fn set_quality(
    State(state): State<AppState>,
    payload: Result<Json<PresetRequest>, JsonRejection>,
) -> ApiResult<crate::service::QualityChange> {
    let request = json_body(payload)?;
    Ok(ApiSuccess::new(
        state.service.set_quality_preset(&request.preset).await?,
    ))
}

#[derive(Debug, Serialize, Deserialize)]
struct EmailBody {
    email: Option<String>,
}

async fn get_email(State(state): State<AppState>) -> ApiResult<EmailBody> {
    Ok(ApiSuccess::new(EmailBody {
        email: state.service.email(),
    }))
}

async fn save_email(
    State(state): State<AppState>,
    payload: Result<Json<EmailBody>, JsonRejection>,
) -> ApiResult<EmailBody> {
    let body = json_body(payload)?;
    let email = body
        .email
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ServiceError::Validation("An email address is required".to_string()))?;
    let saved = state.service.save_email(&email).await?;
    Ok(ApiSuccess::new(EmailBody { email: Some(saved) }))
}

#[derive(Debug, Serialize)]
struct AlertToggle {
    alert_enabled: bool,
}

async fn toggle_alerts(State(state): State<AppState>) -> ApiResult<AlertToggle> {
    let alert_enabled = state.service.toggle_alerts().await;
    Ok(ApiSuccess::new(AlertToggle { alert_enabled }))
}

#[derive(Debug, Serialize)]
struct Empty {}

async fn send_alert(State(state): State<AppState>) -> ApiResult<Empty> {
    state.service.send_alert_now().await?;
    Ok(ApiSuccess::new(Empty {}))
}

/// MJPEG stream for the requesting session.
async fn video_feed(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let id = require_session(&headers)?;
    let service = Arc::clone(&state.service);
    let session = id.clone();
    blocking(move || service.state().get_or_create_session(&session)).await?;

    let body = Body::from_stream(state.streamer.spawn(id));
    Response::builder()
        .header(header::CONTENT_TYPE, mjpeg_content_type())
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(body)
        .map_err(|e| ApiError::from(ServiceError::Internal(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::FakeBackend;
    use crate::camera::CameraError;
    use crate::frame_processor::FrameProcessor;
    use crate::monitoring_state::tests::create_test_state;
    use crate::notifier::{DisabledNotifier, NotifyError};
    use crate::service::ServiceOptions;
    use crate::settings_store::MemorySettingsStore;
    use crate::streamer::StreamTiming;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn create_test_router(dir: &TempDir) -> (Router, Arc<FakeBackend>) {
        let (state, backend) = create_test_state(dir);
        let service = Arc::new(MonitorService::new(
            Arc::new(state),
            Arc::new(FrameProcessor::new(None, None, false, 0)),
            Arc::new(MemorySettingsStore::new()),
            Arc::new(DisabledNotifier::new("test")),
            ServiceOptions {
                auto_capture: false,
                alert_subject: "alert".to_string(),
                alert_cooldown: Duration::from_secs(300),
                session_timeout: Duration::from_secs(60),
            },
        ));
        let timing = StreamTiming {
            idle_poll: Duration::from_millis(5),
            retry_delay: Duration::from_millis(20),
            error_delay: Duration::from_millis(5),
            buffer_frames: 1,
        };
        let app_state = AppState {
            streamer: FrameStreamer::new(Arc::clone(&service), timing, CancellationToken::new()),
            service,
        };
        let capture = CaptureConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        (create_router(app_state, &ServerConfig::default(), &capture), backend)
    }

    async fn json_of(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_json_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let (router, _backend) = create_test_router(&dir);

        let bad_field = Request::post("/api/v1/tuning")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"tolerance_px":"abc"}"#))
            .unwrap();
        let response = router.clone().oneshot(bad_field).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_of(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let not_json = Request::post("/api/v1/email")
            .body(Body::from("email=a@b.c"))
            .unwrap();
        let response = router.oneshot(not_json).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_session_open_runs_camera_off_request_thread() {
        let dir = TempDir::new().unwrap();
        let (router, backend) = create_test_router(&dir);

        let request = Request::get("/api/v1/session").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::SET_COOKIE));
        assert_eq!(json_of(response).await["created"], true);

        let request_thread = std::thread::current().name().map(str::to_string);
        let open_thread = backend.controls.open_thread.lock().clone();
        assert!(open_thread.is_some());
        assert_ne!(open_thread, request_thread);
    }

    #[test]
    fn test_session_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session_id=abc-123; other=1"),
        );
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_session_header_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session_id=cookie"));
        headers.insert(SESSION_HEADER, HeaderValue::from_static("header"));
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("header"));
    }

    #[test]
    fn test_malformed_session_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session_id=a/b"));
        assert!(session_id_from_headers(&headers).is_none());
        assert!(require_session(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ServiceError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ServiceError::UnknownSession("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ServiceError::Camera(CameraError::NoActiveSessions)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ServiceError::Notify(NotifyError::InvalidAddress("x".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ServiceError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_success_body_is_flattened() {
        let Json(body) = ApiSuccess::new(AlertToggle {
            alert_enabled: true,
        });
        let value = serde_json::to_value(body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"success": true, "alert_enabled": true})
        );
    }

    #[test]
    fn test_error_body_shape() {
        let error = ApiError::from(ServiceError::NotifierUnavailable);
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
        let value = serde_json::to_value(&error.body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["code"], "NOTIFIER_UNAVAILABLE");
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("abc").unwrap();
        assert_eq!(cookie.to_str().unwrap(), "session_id=abc; Path=/; HttpOnly; SameSite=Lax");
    }
}
