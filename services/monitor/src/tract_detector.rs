//! YOLOv8 ONNX detector run with tract.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::path::Path;
use tract_onnx::prelude::*;
use tracing::debug;

use crate::detector::{nms, BoundingBox, Detection, Detector, DetectorError};

/// Gray used for the letterbox border.
const PAD_VALUE: u8 = 114;

/// Placement of a frame scaled into the square model input with its aspect
/// ratio kept and the remainder padded.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    width: u32,
    height: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(frame_width: u32, frame_height: u32, side: u32) -> Self {
        let scale = (side as f32 / frame_width.max(1) as f32).min(side as f32 / frame_height.max(1) as f32);
        let width = ((frame_width as f32 * scale).round() as u32).clamp(1, side);
        let height = ((frame_height as f32 * scale).round() as u32).clamp(1, side);
        Self {
            scale,
            width,
            height,
            pad_x: (side - width) / 2,
            pad_y: (side - height) / 2,
        }
    }

    /// Map an input-space coordinate back onto the original frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x as f32) / self.scale, (y - self.pad_y as f32) / self.scale)
    }
}

/// Runs a YOLOv8 export with a `[1, 4 + classes, anchors]` output.
pub struct TractDetector {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    iou_threshold: f32,
}

impl TractDetector {
    /// Load and optimize the model for a square `input_size` input.
    pub fn load(model_path: &Path, input_size: u32, iou_threshold: f32) -> Result<Self, DetectorError> {
        let load_err = |e: TractError| DetectorError::ModelLoad {
            path: model_path.display().to_string(),
            reason: e.to_string(),
        };
        let side = input_size as usize;

        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(load_err)?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .map_err(load_err)?
            .into_optimized()
            .map_err(load_err)?
            .into_runnable()
            .map_err(load_err)?;

        Ok(Self {
            model,
            input_size,
            iou_threshold,
        })
    }

    fn build_input(&self, frame: &RgbImage, letterbox: &Letterbox) -> Tensor {
        let side = self.input_size;
        let resized = imageops::resize(frame, letterbox.width, letterbox.height, FilterType::Triangle);
        let mut canvas = RgbImage::from_pixel(side, side, Rgb([PAD_VALUE; 3]));
        imageops::replace(&mut canvas, &resized, letterbox.pad_x as i64, letterbox.pad_y as i64);
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, side as usize, side as usize),
            |(_, channel, y, x)| canvas.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&self, frame: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>, DetectorError> {
        let letterbox = Letterbox::fit(frame.width(), frame.height(), self.input_size);
        let input = self.build_input(frame, &letterbox);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectorError::InvalidOutput("model produced no outputs".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;

        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(DetectorError::InvalidOutput(format!("shape {:?}", shape)));
        }
        let flat: Vec<f32> = view.iter().copied().collect();

        let raw = decode_yolo(&flat, shape[1], shape[2], confidence_threshold, &letterbox);
        let kept = nms(raw, self.iou_threshold);
        debug!(detections = kept.len(), "Inference complete");
        Ok(kept)
    }
}

/// Decode a row-major `[rows, anchors]` YOLOv8 output. Rows 0..4 are
/// center x, center y, width and height in input pixels; the remaining rows
/// are per-class scores. Boxes are mapped back through `letterbox`.
fn decode_yolo(
    data: &[f32],
    rows: usize,
    anchors: usize,
    confidence_threshold: f32,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];
    let mut detections = Vec::new();

    for anchor in 0..anchors {
        let (class_id, confidence) = (4..rows)
            .map(|row| (row - 4, at(row, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if !confidence.is_finite() || confidence <= confidence_threshold {
            continue;
        }

        let (cx, cy) = (at(0, anchor), at(1, anchor));
        let (w, h) = (at(2, anchor), at(3, anchor));
        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
        detections.push(Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_id: class_id as u32,
            confidence,
        });
    }
    detections
}
