//! Object detection seam.
//!
//! The model is an opaque capability: given an RGB frame and a confidence
//! threshold it returns boxes in frame pixel coordinates with a class id and
//! confidence. Backends live behind the [`Detector`] trait and are selected
//! from configuration at startup.

use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{DetectionConfig, DetectorBackendKind};

/// Errors that can occur while loading or running a detector.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unexpected model output: {0}")]
    InvalidOutput(String),

    #[error("Detector backend not compiled in: {0}")]
    BackendUnavailable(String),
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A single detected object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    pub confidence: f32,
}

/// Object detector over RGB frames.
pub trait Detector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect objects in `frame`, returning only detections with confidence
    /// strictly above `confidence_threshold`.
    fn detect(
        &self,
        frame: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Build the configured detector. `Ok(None)` means detection is disabled.
pub fn build_detector(config: &DetectionConfig) -> Result<Option<Arc<dyn Detector>>, DetectorError> {
    match config.backend {
        DetectorBackendKind::None => {
            info!("Detection disabled by configuration");
            Ok(None)
        }
        DetectorBackendKind::Tract => load_tract(config),
    }
}

#[cfg(feature = "detector-tract")]
fn load_tract(config: &DetectionConfig) -> Result<Option<Arc<dyn Detector>>, DetectorError> {
    let detector = crate::tract_detector::TractDetector::load(
        &config.model_path,
        config.input_size,
        config.iou_threshold,
    )?;
    info!(
        model = %config.model_path.display(),
        input_size = config.input_size,
        "Tract detector loaded"
    );
    Ok(Some(Arc::new(detector)))
}

#[cfg(not(feature = "detector-tract"))]
fn load_tract(_config: &DetectionConfig) -> Result<Option<Arc<dyn Detector>>, DetectorError> {
    Err(DetectorError::BackendUnavailable(
        "rebuild with the `detector-tract` feature".to_string(),
    ))
}

/// Greedy non-maximum suppression: highest confidence first, drop boxes of
/// the same class overlapping a kept box by more than `iou_threshold`.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
