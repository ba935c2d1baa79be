//! Laser alignment monitor service.
//!
//! Serves the monitoring API and per-session MJPEG streams from one shared
//! camera.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{RUN_MODE}.toml)
//! 2. Environment variables (prefixed with MONITOR__)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use laser_monitor::api::{create_router, AppState};
use laser_monitor::camera::SharedCamera;
use laser_monitor::capture_device::{CaptureBackend, TestPatternBackend, UnavailableBackend};
use laser_monitor::capture_store::CaptureStore;
use laser_monitor::config::{CameraBackendKind, LoggingConfig, MonitorConfig};
use laser_monitor::detector::build_detector;
use laser_monitor::frame_processor::FrameProcessor;
use laser_monitor::monitoring_state::{DetectionTuning, MonitoringState};
use laser_monitor::notifier::{AlertNotifier, DisabledNotifier, SmtpNotifier};
use laser_monitor::overlay::load_font;
use laser_monitor::service::{MonitorService, ServiceOptions};
use laser_monitor::settings_store::SqliteSettingsStore;
use laser_monitor::streamer::{FrameStreamer, StreamTiming};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting laser monitor"
    );

    config.validate().context("Invalid configuration")?;

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let camera = Arc::new(SharedCamera::new(
        capture_backend(&config),
        config.camera.device_index,
        config.camera_settings(),
        config.camera.max_read_failures,
    ));

    let detector = match build_detector(&config.detection) {
        Ok(detector) => detector,
        Err(e) => {
            warn!(error = %e, "Detector unavailable, streaming without detection");
            None
        }
    };

    let font = config
        .detection
        .font_path
        .as_deref()
        .and_then(|path| match load_font(path) {
            Ok(font) => Some(font),
            Err(e) => {
                warn!(error = %e, "Overlay font unavailable, drawing shapes only");
                None
            }
        });

    let processor = Arc::new(FrameProcessor::new(
        detector,
        font,
        config.detection.mirror,
        config.detection.target_class_id,
    ));

    let captures = CaptureStore::new(&config.capture).context("Failed to prepare capture directory")?;
    let tuning = DetectionTuning {
        tolerance_px: config.detection.tolerance_px,
        confidence_threshold: config.detection.confidence_threshold,
        target_distance_cm: config.detection.target_distance_cm,
    };
    let state = Arc::new(MonitoringState::new(Arc::clone(&camera), captures, tuning));

    let settings = Arc::new(
        SqliteSettingsStore::connect(&config.database)
            .await
            .context("Failed to open settings database")?,
    );

    let notifier: Arc<dyn AlertNotifier> = if config.email.is_configured() {
        match SmtpNotifier::new(&config.email) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                warn!(error = %e, "SMTP notifier misconfigured, alerts disabled");
                Arc::new(DisabledNotifier::new(e.to_string()))
            }
        }
    } else {
        info!("No SMTP credentials configured, alerts disabled");
        Arc::new(DisabledNotifier::new("no SMTP credentials configured"))
    };

    let service = Arc::new(MonitorService::new(
        Arc::clone(&state),
        processor,
        settings,
        notifier,
        ServiceOptions::from(&config),
    ));
    service.load_persisted_settings().await;

    let shutdown = CancellationToken::new();

    // Session reaper
    let reaper_handle = tokio::spawn({
        let service = Arc::clone(&service);
        let shutdown = shutdown.clone();
        let mut ticker = tokio::time::interval(config.session.cleanup_interval());
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let svc = Arc::clone(&service);
                        let reaped = match tokio::task::spawn_blocking(move || svc.reap_inactive_sessions()).await {
                            Ok(reaped) => reaped,
                            Err(e) => {
                                error!(error = %e, "Session cleanup task failed");
                                continue;
                            }
                        };
                        if !reaped.is_empty() {
                            info!(
                                reaped = reaped.len(),
                                remaining = service.state().session_count(),
                                "Session cleanup"
                            );
                        }
                    }
                }
            }
        }
    });

    let app_state = AppState {
        streamer: FrameStreamer::new(
            Arc::clone(&service),
            StreamTiming::from(&config.stream),
            shutdown.clone(),
        ),
        service,
    };
    let app = create_router(app_state, &config.server, &config.capture);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(address = %addr, "Laser monitor listening");

    let serve_shutdown = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Initiating graceful shutdown...");
            serve_shutdown.cancel();
        })
        .await;

    shutdown.cancel();
    reaper_handle.abort();
    state.clear_sessions();
    camera.shutdown();

    match result {
        Ok(()) => {
            info!("Laser monitor stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            Err(e.into())
        }
    }
}

/// Load configuration from files, falling back to the environment.
fn load_config() -> Result<MonitorConfig> {
    let config = MonitorConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        MonitorConfig::from_env()
    })?;
    Ok(config)
}

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("laser_monitor={},tower_http=info", config.level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Capture backend for the configured kind.
fn capture_backend(config: &MonitorConfig) -> Arc<dyn CaptureBackend> {
    match config.camera.backend {
        CameraBackendKind::TestPattern => {
            info!("Using synthetic test pattern camera");
            Arc::new(TestPatternBackend::default())
        }
        CameraBackendKind::Gstreamer => gstreamer_backend(config),
    }
}

#[cfg(feature = "camera-gstreamer")]
fn gstreamer_backend(config: &MonitorConfig) -> Arc<dyn CaptureBackend> {
    use laser_monitor::gst_device::GstreamerBackend;

    match GstreamerBackend::new(config.camera.open_timeout(), config.camera.read_timeout()) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            error!(error = %e, "GStreamer initialization failed, camera disabled");
            Arc::new(UnavailableBackend::new(e.to_string()))
        }
    }
}

#[cfg(not(feature = "camera-gstreamer"))]
fn gstreamer_backend(_config: &MonitorConfig) -> Arc<dyn CaptureBackend> {
    error!("Camera backend `gstreamer` requested but the `camera-gstreamer` feature is not enabled");
    Arc::new(UnavailableBackend::new(
        "rebuild with the `camera-gstreamer` feature",
    ))
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
