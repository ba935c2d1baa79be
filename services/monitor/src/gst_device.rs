//! V4L2 camera capture through GStreamer pipelines.
//!
//! One pipeline per open device, ending in an `appsink` that is pulled
//! synchronously by the shared camera's reader.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::camera::CameraError;
use crate::capture_device::{CaptureBackend, VideoDevice};
use crate::video_settings::VideoSettings;

/// Opens `/dev/video{N}` devices.
pub struct GstreamerBackend {
    open_timeout: Duration,
    read_timeout: Duration,
}

impl GstreamerBackend {
    /// Initialize GStreamer and create the backend.
    pub fn new(open_timeout: Duration, read_timeout: Duration) -> Result<Self, CameraError> {
        gst::init().map_err(|e| CameraError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            open_timeout,
            read_timeout,
        })
    }
}

impl CaptureBackend for GstreamerBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(&self, index: u32, settings: &VideoSettings) -> Result<Box<dyn VideoDevice>, CameraError> {
        let mut device = GstreamerDevice {
            index,
            open_timeout: self.open_timeout,
            read_timeout: self.read_timeout,
            pipeline: None,
            sink: None,
        };
        device.start(settings)?;
        Ok(Box::new(device))
    }
}

/// Pipeline description for a device and requested settings.
pub fn pipeline_description(index: u32, settings: &VideoSettings) -> String {
    let mode = settings.mode();
    let decode = mode
        .decoder()
        .map(|element| format!(" ! {}", element))
        .unwrap_or_default();

    format!(
        "v4l2src device=/dev/video{index} ! {caps},width={w},height={h},framerate={fps}/1{decode} \
         ! videoconvert ! video/x-raw,format=RGB \
         ! appsink name=sink max-buffers={buffers} drop=true sync=false",
        index = index,
        caps = mode.source_caps(),
        w = settings.width,
        h = settings.height,
        fps = settings.fps,
        decode = decode,
        buffers = mode.buffer_size(),
    )
}

struct GstreamerDevice {
    index: u32,
    open_timeout: Duration,
    read_timeout: Duration,
    pipeline: Option<gst::Pipeline>,
    sink: Option<gst_app::AppSink>,
}

impl GstreamerDevice {
    fn start(&mut self, settings: &VideoSettings) -> Result<(), CameraError> {
        let description = pipeline_description(self.index, settings);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let open_failed = |reason: String| CameraError::OpenFailed {
            index: self.index,
            reason,
        };

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| open_failed(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_failed("not a pipeline".to_string()))?;

        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_failed("appsink missing".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_failed("sink is not an AppSink".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_failed(e.to_string()))?;

        let (result, _state, _pending) = pipeline.state(gst::ClockTime::from_mseconds(
            self.open_timeout.as_millis() as u64,
        ));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_failed("timeout waiting for pipeline to start".to_string()));
        }

        info!(
            index = self.index,
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            mode = ?settings.mode(),
            "Camera pipeline playing"
        );

        self.pipeline = Some(pipeline);
        self.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.sink = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

impl VideoDevice for GstreamerDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| CameraError::ReadFailed("device closed".to_string()))?;

        let sample = sink
            .try_pull_sample(gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64))
            .ok_or_else(|| CameraError::ReadFailed("no sample before timeout".to_string()))?;
        let buffer = sample.buffer().ok_or(CameraError::EmptyFrame)?;
        let caps = sample
            .caps()
            .ok_or_else(|| CameraError::ReadFailed("sample without caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CameraError::ReadFailed(e.to_string()))?;

        let map = buffer
            .map_readable()
            .map_err(|e| CameraError::ReadFailed(e.to_string()))?;
        rgb_from_strided(map.as_slice(), info.width(), info.height(), info.stride()[0] as usize)
    }

    fn apply_settings(&mut self, settings: &VideoSettings) -> Result<(), CameraError> {
        // Caps are fixed at launch, so reconfiguring means a new pipeline.
        self.stop();
        self.start(settings).map_err(|e| {
            warn!(index = self.index, error = %e, "Pipeline rebuild failed");
            CameraError::SettingsRejected(e.to_string())
        })
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }

    fn close(&mut self) {
        if self.pipeline.is_some() {
            debug!(index = self.index, "Closing camera pipeline");
        }
        self.stop();
    }
}

impl Drop for GstreamerDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Copy packed RGB rows out of a buffer whose rows may be padded.
fn rgb_from_strided(data: &[u8], width: u32, height: u32, stride: usize) -> Result<RgbImage, CameraError> {
    let row = width as usize * 3;
    if width == 0 || height == 0 || stride < row || data.len() < stride * (height as usize - 1) + row {
        return Err(CameraError::EmptyFrame);
    }

    let mut pixels = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        pixels.extend_from_slice(&data[start..start + row]);
    }
    RgbImage::from_raw(width, height, pixels).ok_or(CameraError::EmptyFrame)
}
