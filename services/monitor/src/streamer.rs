//! Per-session MJPEG streaming loop.
//!
//! Each viewer gets one task that pulls frames from the shared camera while
//! its session is monitoring, idles while it is not, and ends when the
//! session is reaped, the client goes away or the service shuts down.

use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::service::{MonitorService, ServiceError};

/// Multipart boundary for the MJPEG response.
pub const MJPEG_BOUNDARY: &str = "frame";

pub fn mjpeg_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY)
}

/// Wrap one JPEG as a multipart part.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MJPEG_BOUNDARY);
    let mut buf = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Fixed-delay retry policy for reopening the camera.
pub fn camera_retry_backoff(delay: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: delay,
        initial_interval: delay,
        max_interval: delay,
        multiplier: 1.0,
        randomization_factor: 0.0,
        max_elapsed_time: None, // Retry for as long as the session lives
        ..Default::default()
    }
}

/// Timing knobs for the streaming loop.
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    pub idle_poll: Duration,
    pub retry_delay: Duration,
    pub error_delay: Duration,
    pub buffer_frames: usize,
}

impl From<&StreamConfig> for StreamTiming {
    fn from(config: &StreamConfig) -> Self {
        Self {
            idle_poll: config.idle_poll(),
            retry_delay: config.retry_delay(),
            error_delay: config.error_delay(),
            buffer_frames: config.buffer_frames.max(1),
        }
    }
}

/// Spawns streaming tasks for viewer sessions.
#[derive(Clone)]
pub struct FrameStreamer {
    service: Arc<MonitorService>,
    timing: StreamTiming,
    shutdown: CancellationToken,
}

impl FrameStreamer {
    pub fn new(service: Arc<MonitorService>, timing: StreamTiming, shutdown: CancellationToken) -> Self {
        Self {
            service,
            timing,
            shutdown,
        }
    }

    /// Start streaming for `session_id`, returning the body stream.
    pub fn spawn(&self, session_id: String) -> ReceiverStream<Result<Bytes, Infallible>> {
        let (tx, rx) = mpsc::channel(self.timing.buffer_frames);
        let service = Arc::clone(&self.service);
        let timing = self.timing;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!(session_id = %session_id, "Stream started");
            run_stream(service, &session_id, tx, timing, shutdown).await;
            info!(session_id = %session_id, "Stream ended");
        });

        ReceiverStream::new(rx)
    }
}

async fn run_stream(
    service: Arc<MonitorService>,
    session_id: &str,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    timing: StreamTiming,
    shutdown: CancellationToken,
) {
    let mut retry = camera_retry_backoff(timing.retry_delay);
    let state = Arc::clone(service.state());

    loop {
        if shutdown.is_cancelled() || tx.is_closed() {
            return;
        }

        match state.session_monitoring(session_id) {
            None => {
                debug!(session_id = %session_id, "Session gone, stopping stream");
                return;
            }
            Some(false) => {
                if !pause(&shutdown, timing.idle_poll).await {
                    return;
                }
                continue;
            }
            Some(true) => {}
        }

        if !state.camera().is_active() {
            let svc = Arc::clone(&service);
            let opened = match tokio::task::spawn_blocking(move || svc.ensure_camera()).await {
                Ok(result) => result,
                Err(e) => Err(ServiceError::Internal(e.to_string())),
            };
            if let Err(e) = opened {
                let delay = retry.next_backoff().unwrap_or(timing.retry_delay);
                warn!(
                    session_id = %session_id,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Camera unavailable, retrying"
                );
                if !pause(&shutdown, delay).await {
                    return;
                }
                continue;
            }
            retry.reset();
        }

        let started = Instant::now();
        let svc = Arc::clone(&service);
        match tokio::task::spawn_blocking(move || svc.process_tick()).await {
            Ok(Ok(Some(outcome))) => {
                service.maybe_auto_alert(outcome.status);
                if tx.send(Ok(mjpeg_part(&outcome.jpeg))).await.is_err() {
                    debug!(session_id = %session_id, "Client disconnected");
                    return;
                }
                let fps = state.camera().settings().fps.max(1);
                let period = Duration::from_secs_f64(1.0 / fps as f64);
                if let Some(remaining) = period.checked_sub(started.elapsed()) {
                    if !pause(&shutdown, remaining).await {
                        return;
                    }
                }
            }
            Ok(Ok(None)) => {
                if !pause(&shutdown, timing.idle_poll).await {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Frame skipped");
                if !pause(&shutdown, timing.error_delay).await {
                    return;
                }
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Frame task panicked");
                if !pause(&shutdown, timing.error_delay).await {
                    return;
                }
            }
        }
    }
}

/// Sleep for `delay`; false if shutdown fired first.
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_processor::FrameProcessor;
    use crate::monitoring_state::tests::create_test_state;
    use crate::notifier::DisabledNotifier;
    use crate::service::ServiceOptions;
    use crate::settings_store::MemorySettingsStore;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    fn timing() -> StreamTiming {
        StreamTiming {
            idle_poll: Duration::from_millis(5),
            retry_delay: Duration::from_millis(20),
            error_delay: Duration::from_millis(5),
            buffer_frames: 1,
        }
    }

    fn create_test_service(dir: &TempDir) -> Arc<MonitorService> {
        let (state, _backend) = create_test_state(dir);
        Arc::new(MonitorService::new(
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
        ))
    }

    #[test]
    fn test_mjpeg_part_layout() {
        let part = mjpeg_part(&[1, 2, 3]);
        let expected: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\x01\x02\x03\r\n";
        assert_eq!(&part[..], expected);
        assert_eq!(
            mjpeg_content_type(),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }

    #[test]
    fn test_camera_retry_delay_is_fixed() {
        let mut backoff = camera_retry_backoff(Duration::from_secs(5));
        for _ in 0..4 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= Duration::from_secs(5));
            assert!(delay < Duration::from_secs(5) + Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn test_monitoring_session_receives_frames() {
        let dir = TempDir::new().unwrap();
        let service = create_test_service(&dir);
        service.start_monitoring("viewer");

        let shutdown = CancellationToken::new();
        let streamer = FrameStreamer::new(Arc::clone(&service), timing(), shutdown.clone());
        let mut stream = streamer.spawn("viewer".to_string());

        let part = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stream_ends_when_session_reaped() {
        let dir = TempDir::new().unwrap();
        let service = create_test_service(&dir);
        service.open_session(Some("viewer"));

        let streamer = FrameStreamer::new(Arc::clone(&service), timing(), CancellationToken::new());
        let mut stream = streamer.spawn("viewer".to_string());

        let later = Instant::now() + Duration::from_secs(120);
        service
            .state()
            .reap_sessions_at(later, Duration::from_secs(60));

        let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let service = create_test_service(&dir);
        service.open_session(Some("viewer"));

        let shutdown = CancellationToken::new();
        let streamer = FrameStreamer::new(Arc::clone(&service), timing(), shutdown.clone());
        let mut stream = streamer.spawn("viewer".to_string());
        shutdown.cancel();

        let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
