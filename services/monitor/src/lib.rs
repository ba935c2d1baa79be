//! Laser alignment monitor.
//!
//! A single physical camera is shared by every viewer session. While a
//! session is monitoring, frames are run through person detection, checked
//! against a target point, annotated and streamed back as MJPEG.
//!
//! ```text
//! CaptureBackend -> SharedCamera -> FrameProcessor -> FrameStreamer -> HTTP client
//!                                         |
//!                                         +-> CaptureStore / AlertNotifier
//! ```

pub mod api;
pub mod camera;
pub mod capture_device;
pub mod capture_store;
pub mod config;
pub mod detector;
pub mod frame_processor;
#[cfg(feature = "camera-gstreamer")]
pub mod gst_device;
pub mod monitoring_state;
pub mod notifier;
pub mod overlay;
pub mod service;
pub mod settings_store;
pub mod streamer;
#[cfg(feature = "detector-tract")]
pub mod tract_detector;
pub mod video_settings;
