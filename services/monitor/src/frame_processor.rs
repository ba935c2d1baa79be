//! Per-frame detection and alignment analysis.
//!
//! Each frame is mirrored, run through the detector, reduced to a single best
//! match, measured against the frame center and annotated. The result is
//! written into the shared monitoring state (last write wins across sessions).

use ab_glyph::FontArc;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, RgbImage};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::detector::{BoundingBox, Detection, Detector};
use crate::monitoring_state::{DetectionTuning, MonitoringState};
use crate::overlay::{self, OverlayPlan};

/// Assumed subject height in centimeters.
const ASSUMED_SUBJECT_HEIGHT_CM: f32 = 170.0;
/// Share of the frame height the subject is assumed to occupy.
const SUBJECT_FRAME_SHARE: f32 = 0.8;

/// Alignment outcome for the most recent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentStatus {
    /// No frame processed yet
    Waiting,
    ModelUnavailable,
    DetectionFailed,
    NoPersonDetected,
    Normal,
    OffLeft,
    OffRight,
    TooHigh,
    TooLow,
    OffCenter,
}

impl AlignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignmentStatus::Waiting => "waiting",
            AlignmentStatus::ModelUnavailable => "model_unavailable",
            AlignmentStatus::DetectionFailed => "detection_failed",
            AlignmentStatus::NoPersonDetected => "no_person_detected",
            AlignmentStatus::Normal => "normal",
            AlignmentStatus::OffLeft => "off_left",
            AlignmentStatus::OffRight => "off_right",
            AlignmentStatus::TooHigh => "too_high",
            AlignmentStatus::TooLow => "too_low",
            AlignmentStatus::OffCenter => "off_center",
        }
    }

    /// Operator-facing description.
    pub fn message(&self) -> &'static str {
        match self {
            AlignmentStatus::Waiting => "Waiting for frames",
            AlignmentStatus::ModelUnavailable => "Detection model unavailable",
            AlignmentStatus::DetectionFailed => "Detection failed",
            AlignmentStatus::NoPersonDetected => "No person detected",
            AlignmentStatus::Normal => "Normal - position OK",
            AlignmentStatus::OffLeft => "Abnormal - target is left of center",
            AlignmentStatus::OffRight => "Abnormal - target is right of center",
            AlignmentStatus::TooHigh => "Abnormal - target is too high",
            AlignmentStatus::TooLow => "Abnormal - target is too low",
            AlignmentStatus::OffCenter => "Abnormal - target is off center",
        }
    }

    /// True for misalignment; absence of a subject or a model is not abnormal.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            AlignmentStatus::OffLeft
                | AlignmentStatus::OffRight
                | AlignmentStatus::TooHigh
                | AlignmentStatus::TooLow
                | AlignmentStatus::OffCenter
        )
    }
}

impl std::fmt::Display for AlignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geometry of the best match relative to the frame center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    pub center: (f32, f32),
    pub target: (f32, f32),
    pub distance_x: f32,
    pub distance_y: f32,
    pub distance_px: f32,
    pub distance_cm: u32,
    pub status: AlignmentStatus,
}

/// Result of analysing one frame, before any drawing.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnalysis {
    pub status: AlignmentStatus,
    pub distance_cm: u32,
    pub best_match: Option<Detection>,
    pub plan: OverlayPlan,
}

impl FrameAnalysis {
    fn crosshair_only(width: u32, height: u32, status: AlignmentStatus) -> Self {
        Self {
            status,
            distance_cm: 0,
            best_match: None,
            plan: OverlayPlan::crosshair(width, height),
        }
    }
}

/// An annotated frame and the analysis that produced it.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub image: RgbImage,
    pub status: AlignmentStatus,
    pub distance_cm: u32,
}

/// Pixels per centimeter at the subject, from the fixed height heuristic.
pub fn pixels_per_cm(frame_height: u32) -> f32 {
    frame_height as f32 * SUBJECT_FRAME_SHARE / ASSUMED_SUBJECT_HEIGHT_CM
}

/// The qualifying detection with the smallest top edge; the first wins ties.
pub fn select_best_match(
    detections: &[Detection],
    target_class_id: u32,
    confidence_threshold: f32,
) -> Option<&Detection> {
    detections
        .iter()
        .filter(|d| d.class_id == target_class_id && d.confidence > confidence_threshold)
        .fold(None, |best: Option<&Detection>, d| match best {
            Some(b) if b.bbox.y1 <= d.bbox.y1 => Some(b),
            _ => Some(d),
        })
}

/// Classify signed target offsets (target minus center) against a tolerance.
pub fn classify(offset_x: f32, offset_y: f32, tolerance_px: f32) -> AlignmentStatus {
    let x_out = offset_x.abs() > tolerance_px;
    let y_out = offset_y.abs() > tolerance_px;
    match (x_out, y_out) {
        (false, false) => AlignmentStatus::Normal,
        (true, false) if offset_x < 0.0 => AlignmentStatus::OffLeft,
        (true, false) => AlignmentStatus::OffRight,
        (false, true) if offset_y < 0.0 => AlignmentStatus::TooHigh,
        (false, true) => AlignmentStatus::TooLow,
        (true, true) => AlignmentStatus::OffCenter,
    }
}

/// Measure `bbox` against the center of a `width` x `height` frame.
pub fn measure(bbox: &BoundingBox, width: u32, height: u32, tuning: &DetectionTuning) -> Alignment {
    let ppc = pixels_per_cm(height);
    let center = overlay::frame_center(width, height);
    let target = (bbox.center_x(), bbox.y1 + tuning.target_distance_cm * ppc);

    let offset_x = target.0 - center.0;
    let offset_y = target.1 - center.1;
    let distance_px = offset_x.hypot(offset_y);

    Alignment {
        center,
        target,
        distance_x: offset_x.abs(),
        distance_y: offset_y.abs(),
        distance_px,
        distance_cm: (distance_px / ppc).round() as u32,
        status: classify(offset_x, offset_y, tuning.tolerance_px as f32),
    }
}

/// Reduce raw detections for a frame to a status, distance and overlay plan.
pub fn analyze(
    width: u32,
    height: u32,
    detections: &[Detection],
    tuning: &DetectionTuning,
    target_class_id: u32,
) -> FrameAnalysis {
    let Some(best) = select_best_match(detections, target_class_id, tuning.confidence_threshold)
    else {
        return FrameAnalysis::crosshair_only(width, height, AlignmentStatus::NoPersonDetected);
    };

    let alignment = measure(&best.bbox, width, height, tuning);
    let plan = OverlayPlan {
        center: alignment.center,
        target: Some(alignment.target),
        bbox: Some(best.bbox),
        aligned: alignment.status == AlignmentStatus::Normal,
        lines: vec![
            alignment.status.message().to_string(),
            format!("Distance: {} cm", alignment.distance_cm),
            format!("Confidence: {:.2}", best.confidence),
            format!(
                "Offset: {:.0}px, {:.0}px",
                alignment.distance_x, alignment.distance_y
            ),
        ],
    };

    FrameAnalysis {
        status: alignment.status,
        distance_cm: alignment.distance_cm,
        best_match: Some(*best),
        plan,
    }
}

/// Runs detection and draws overlays for every streamed frame.
pub struct FrameProcessor {
    detector: Option<Arc<dyn Detector>>,
    font: Option<FontArc>,
    mirror: bool,
    target_class_id: u32,
}

impl FrameProcessor {
    pub fn new(
        detector: Option<Arc<dyn Detector>>,
        font: Option<FontArc>,
        mirror: bool,
        target_class_id: u32,
    ) -> Self {
        Self {
            detector,
            font,
            mirror,
            target_class_id,
        }
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    /// Analyse and annotate `frame`, publishing the status to `state`.
    pub fn process(&self, frame: RgbImage, state: &MonitoringState) -> ProcessedFrame {
        let processed = self.process_with(frame, &state.tuning());
        state.set_status(processed.status, processed.distance_cm);
        processed
    }

    /// Analyse and annotate `frame` with explicit tuning.
    pub fn process_with(&self, mut frame: RgbImage, tuning: &DetectionTuning) -> ProcessedFrame {
        if self.mirror {
            image::imageops::flip_horizontal_in_place(&mut frame);
        }
        let (width, height) = frame.dimensions();

        let analysis = match &self.detector {
            Some(_) if width == 0 || height == 0 => {
                FrameAnalysis::crosshair_only(width, height, AlignmentStatus::ModelUnavailable)
            }
            None => FrameAnalysis::crosshair_only(width, height, AlignmentStatus::ModelUnavailable),
            Some(detector) => match detector.detect(&frame, tuning.confidence_threshold) {
                Ok(detections) => {
                    debug!(
                        detector = detector.name(),
                        count = detections.len(),
                        "Detections received"
                    );
                    analyze(width, height, &detections, tuning, self.target_class_id)
                }
                Err(e) => {
                    warn!(error = %e, "Detection failed, drawing crosshair only");
                    FrameAnalysis::crosshair_only(width, height, AlignmentStatus::DetectionFailed)
                }
            },
        };

        if let Err(e) = overlay::draw(&mut frame, &analysis.plan, self.font.as_ref()) {
            warn!(error = %e, "Overlay skipped");
        }

        metrics::counter!("monitor.frames.processed").increment(1);

        ProcessedFrame {
            image: frame,
            status: analysis.status,
            distance_cm: analysis.distance_cm,
        }
    }
}

/// Encode an RGB frame as JPEG at `quality` (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::with_capacity((image.width() * image.height()) as usize / 4);
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::DetectorError;

    /// Detector returning a fixed list, or an error when `fail` is set.
    pub struct FixedDetector {
        pub detections: Vec<Detection>,
        pub fail: bool,
    }

    impl Detector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(
            &self,
            _frame: &RgbImage,
            _confidence_threshold: f32,
        ) -> Result<Vec<Detection>, DetectorError> {
            if self.fail {
                Err(DetectorError::Inference("boom".to_string()))
            } else {
                Ok(self.detections.clone())
            }
        }
    }

    fn person(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_id: 0,
            confidence,
        }
    }

    fn tuning(tolerance_px: u32, target_distance_cm: f32) -> DetectionTuning {
        DetectionTuning {
            tolerance_px,
            confidence_threshold: 0.5,
            target_distance_cm,
        }
    }

    fn processor(detections: Vec<Detection>) -> FrameProcessor {
        let detector: Arc<dyn Detector> = Arc::new(FixedDetector {
            detections,
            fail: false,
        });
        FrameProcessor::new(Some(detector), None, false, 0)
    }

    #[test]
    fn test_no_detections_gives_zero_distance() {
        let result = processor(vec![]).process_with(RgbImage::new(640, 480), &tuning(50, 10.0));
        assert_eq!(result.status, AlignmentStatus::NoPersonDetected);
        assert_eq!(result.distance_cm, 0);
    }

    #[test]
    fn test_low_confidence_and_other_classes_ignored() {
        let mut chair = person(100.0, 100.0, 200.0, 300.0, 0.9);
        chair.class_id = 56;
        let analysis = analyze(
            640,
            480,
            &[chair, person(100.0, 100.0, 200.0, 300.0, 0.3)],
            &tuning(50, 10.0),
            0,
        );
        assert_eq!(analysis.status, AlignmentStatus::NoPersonDetected);
        assert!(analysis.best_match.is_none());
    }

    #[test]
    fn test_topmost_box_selected_regardless_of_order() {
        let high = person(100.0, 100.0, 200.0, 400.0, 0.7);
        let low = person(300.0, 150.0, 400.0, 400.0, 0.95);

        let forward = [high, low];
        let reverse = [low, high];
        assert_eq!(select_best_match(&forward, 0, 0.5).map(|d| d.bbox.y1), Some(100.0));
        assert_eq!(select_best_match(&reverse, 0, 0.5).map(|d| d.bbox.y1), Some(100.0));
    }

    #[test]
    fn test_exact_tie_keeps_first_encountered() {
        let first = person(10.0, 100.0, 50.0, 200.0, 0.6);
        let second = person(300.0, 100.0, 350.0, 200.0, 0.9);
        let pair = [first, second];
        let best = select_best_match(&pair, 0, 0.5);
        assert_eq!(best.map(|d| d.bbox.x1), Some(10.0));
    }

    #[test]
    fn test_measured_center_matches_drawn_crosshair() {
        let bbox = BoundingBox::new(100.0, 100.0, 200.0, 300.0);
        for (width, height) in [(641, 481), (640, 480), (1, 1)] {
            let alignment = measure(&bbox, width, height, &tuning(50, 10.0));
            assert_eq!(alignment.center, OverlayPlan::crosshair(width, height).center);
        }
    }

    #[test]
    fn test_target_at_center_is_normal_for_any_tolerance() {
        let centered = BoundingBox::new(300.0, 240.0, 340.0, 400.0);
        for tolerance in [0, 1, 50, 500] {
            let alignment = measure(&centered, 640, 480, &tuning(tolerance, 0.0));
            assert_eq!(alignment.distance_x, 0.0);
            assert_eq!(alignment.distance_y, 0.0);
            assert_eq!(alignment.status, AlignmentStatus::Normal);
            assert_eq!(alignment.distance_cm, 0);
        }
    }

    #[test]
    fn test_target_offset_uses_calibration() {
        let bbox = BoundingBox::new(300.0, 100.0, 340.0, 400.0);
        let alignment = measure(&bbox, 640, 480, &tuning(50, 10.0));
        let expected_y = 100.0 + 10.0 * pixels_per_cm(480);
        assert!((alignment.target.1 - expected_y).abs() < 1e-3);
        assert_eq!(alignment.target.0, 320.0);
    }

    #[test]
    fn test_distance_cm_from_pixels() {
        // 480 px frame: 0.8 * 480 / 170 px per cm
        let ppc = pixels_per_cm(480);
        let bbox = BoundingBox::new(300.0, 240.0, 340.0, 400.0);
        let mut shifted = bbox;
        shifted.x1 += 100.0;
        shifted.x2 += 100.0;
        let alignment = measure(&shifted, 640, 480, &tuning(50, 0.0));
        assert_eq!(alignment.distance_cm, (100.0 / ppc).round() as u32);
        assert_eq!(alignment.status, AlignmentStatus::OffRight);
    }

    #[test]
    fn test_classify_directions() {
        assert_eq!(classify(-60.0, 0.0, 50.0), AlignmentStatus::OffLeft);
        assert_eq!(classify(60.0, 10.0, 50.0), AlignmentStatus::OffRight);
        assert_eq!(classify(0.0, -60.0, 50.0), AlignmentStatus::TooHigh);
        assert_eq!(classify(5.0, 60.0, 50.0), AlignmentStatus::TooLow);
        assert_eq!(classify(60.0, 60.0, 50.0), AlignmentStatus::OffCenter);
        assert_eq!(classify(50.0, -50.0, 50.0), AlignmentStatus::Normal);
    }

    #[test]
    fn test_missing_detector_draws_crosshair() {
        let processor = FrameProcessor::new(None, None, true, 0);
        let result = processor.process_with(RgbImage::new(64, 48), &tuning(50, 10.0));
        assert_eq!(result.status, AlignmentStatus::ModelUnavailable);
        assert_eq!(result.distance_cm, 0);
        assert_ne!(*result.image.get_pixel(32, 24), image::Rgb([0, 0, 0]));
    }

    #[test]
    fn test_empty_frame_skips_detection() {
        let result = processor(vec![person(0.0, 0.0, 10.0, 10.0, 0.9)])
            .process_with(RgbImage::new(0, 0), &tuning(50, 10.0));
        assert_eq!(result.status, AlignmentStatus::ModelUnavailable);
    }

    #[test]
    fn test_detector_error_degrades() {
        let detector: Arc<dyn Detector> = Arc::new(FixedDetector {
            detections: vec![],
            fail: true,
        });
        let processor = FrameProcessor::new(Some(detector), None, false, 0);
        let result = processor.process_with(RgbImage::new(64, 48), &tuning(50, 10.0));
        assert_eq!(result.status, AlignmentStatus::DetectionFailed);
        assert_eq!(result.distance_cm, 0);
    }

    #[test]
    fn test_degenerate_box_returns_unannotated_frame() {
        let flat = person(10.0, 10.0, 10.0, 30.0, 0.9);
        let result = processor(vec![flat]).process_with(RgbImage::new(64, 48), &tuning(50, 0.0));
        assert!(result.image.pixels().all(|p| *p == image::Rgb([0, 0, 0])));
        assert_ne!(result.status, AlignmentStatus::NoPersonDetected);
    }

    #[test]
    fn test_abnormal_statuses() {
        assert!(AlignmentStatus::OffCenter.is_abnormal());
        assert!(!AlignmentStatus::Normal.is_abnormal());
        assert!(!AlignmentStatus::NoPersonDetected.is_abnormal());
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg_magic() {
        let bytes = encode_jpeg(&RgbImage::new(16, 16), 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
