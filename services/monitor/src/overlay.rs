//! Visualization overlays drawn onto processed frames.
//!
//! Overlays are planned first and validated before any pixel is touched, so a
//! bad plan leaves the frame unannotated instead of half-drawn.

use ab_glyph::FontArc;
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut,
    draw_text_mut,
};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

use crate::detector::BoundingBox;

const CENTER_COLOR: Rgb<u8> = Rgb([255, 64, 64]);
const BOX_OK_COLOR: Rgb<u8> = Rgb([0, 220, 0]);
const BOX_ALERT_COLOR: Rgb<u8> = Rgb([255, 160, 0]);
const TARGET_COLOR: Rgb<u8> = Rgb([0, 200, 255]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const MARKER_RADIUS: i32 = 5;
const TEXT_SCALE: f32 = 20.0;
const TEXT_LINE_HEIGHT: i32 = 24;

/// Errors raised while planning or preparing an overlay.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Degenerate bounding box {width}x{height}")]
    DegenerateBox { width: f32, height: f32 },

    #[error("Non-finite overlay coordinate: {0}")]
    NonFinite(&'static str),

    #[error("Failed to load font {path}: {reason}")]
    Font { path: String, reason: String },
}

/// Pixel the alignment is measured against and the crosshair is drawn through.
pub fn frame_center(width: u32, height: u32) -> (f32, f32) {
    ((width / 2) as f32, (height / 2) as f32)
}

/// Everything to draw on one frame, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayPlan {
    pub center: (f32, f32),
    pub target: Option<(f32, f32)>,
    pub bbox: Option<BoundingBox>,
    pub aligned: bool,
    pub lines: Vec<String>,
}

impl OverlayPlan {
    /// Crosshair through the frame center and nothing else.
    pub fn crosshair(width: u32, height: u32) -> Self {
        Self {
            center: frame_center(width, height),
            target: None,
            bbox: None,
            aligned: false,
            lines: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), OverlayError> {
        if !(self.center.0.is_finite() && self.center.1.is_finite()) {
            return Err(OverlayError::NonFinite("center"));
        }
        if let Some((x, y)) = self.target {
            if !(x.is_finite() && y.is_finite()) {
                return Err(OverlayError::NonFinite("target"));
            }
        }
        if let Some(bbox) = &self.bbox {
            let coords = [bbox.x1, bbox.y1, bbox.x2, bbox.y2];
            if coords.iter().any(|c| !c.is_finite()) {
                return Err(OverlayError::NonFinite("bbox"));
            }
            if bbox.width() < 1.0 || bbox.height() < 1.0 {
                return Err(OverlayError::DegenerateBox {
                    width: bbox.width(),
                    height: bbox.height(),
                });
            }
        }
        Ok(())
    }
}

/// Load a TTF/OTF font for text overlays.
pub fn load_font(path: &Path) -> Result<FontArc, OverlayError> {
    let bytes = std::fs::read(path).map_err(|e| OverlayError::Font {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    FontArc::try_from_vec(bytes).map_err(|e| OverlayError::Font {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Validate `plan` and draw it onto `frame`. Text is skipped without a font.
pub fn draw(
    frame: &mut RgbImage,
    plan: &OverlayPlan,
    font: Option<&FontArc>,
) -> Result<(), OverlayError> {
    plan.validate()?;
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Ok(());
    }

    let (cx, cy) = plan.center;
    draw_line_segment_mut(frame, (cx, 0.0), (cx, height as f32), CENTER_COLOR);
    draw_line_segment_mut(frame, (0.0, cy), (width as f32, cy), CENTER_COLOR);
    draw_filled_circle_mut(frame, (cx as i32, cy as i32), MARKER_RADIUS, CENTER_COLOR);

    if let Some(bbox) = &plan.bbox {
        let color = if plan.aligned {
            BOX_OK_COLOR
        } else {
            BOX_ALERT_COLOR
        };
        let rect = Rect::at(bbox.x1 as i32, bbox.y1 as i32)
            .of_size(bbox.width().max(1.0) as u32, bbox.height().max(1.0) as u32);
        draw_hollow_rect_mut(frame, rect, color);
    }

    if let Some((tx, ty)) = plan.target {
        draw_line_segment_mut(frame, (cx, cy), (tx, ty), TARGET_COLOR);
        draw_filled_circle_mut(frame, (tx as i32, ty as i32), MARKER_RADIUS, TARGET_COLOR);
        draw_hollow_circle_mut(frame, (tx as i32, ty as i32), MARKER_RADIUS * 3, TARGET_COLOR);
    }

    if let Some(font) = font {
        for (i, line) in plan.lines.iter().enumerate() {
            let y = 10 + i as i32 * TEXT_LINE_HEIGHT;
            draw_text_mut(frame, TEXT_COLOR, 10, y, TEXT_SCALE, font, line);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crosshair_marks_center() {
        let mut frame = RgbImage::new(64, 48);
        draw(&mut frame, &OverlayPlan::crosshair(64, 48), None).unwrap();
        assert_eq!(*frame.get_pixel(32, 24), CENTER_COLOR);
        assert_eq!(*frame.get_pixel(32, 2), CENTER_COLOR);
        assert_eq!(*frame.get_pixel(0, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_center_on_whole_pixel_for_odd_sizes() {
        assert_eq!(frame_center(65, 49), (32.0, 24.0));
        let mut frame = RgbImage::new(65, 49);
        draw(&mut frame, &OverlayPlan::crosshair(65, 49), None).unwrap();
        assert_eq!(*frame.get_pixel(32, 1), CENTER_COLOR);
    }

    #[test]
    fn test_degenerate_box_rejected_before_drawing() {
        let mut frame = RgbImage::new(64, 48);
        let mut plan = OverlayPlan::crosshair(64, 48);
        plan.bbox = Some(BoundingBox::new(10.0, 10.0, 10.0, 30.0));
        assert!(matches!(
            draw(&mut frame, &plan, None),
            Err(OverlayError::DegenerateBox { .. })
        ));
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_non_finite_target_rejected() {
        let mut plan = OverlayPlan::crosshair(64, 48);
        plan.target = Some((f32::NAN, 3.0));
        assert!(matches!(plan.validate(), Err(OverlayError::NonFinite("target"))));
    }

    #[test]
    fn test_box_drawn_in_alert_color() {
        let mut frame = RgbImage::new(64, 48);
        let mut plan = OverlayPlan::crosshair(64, 48);
        plan.bbox = Some(BoundingBox::new(4.0, 4.0, 20.0, 20.0));
        draw(&mut frame, &plan, None).unwrap();
        assert_eq!(*frame.get_pixel(4, 10), BOX_ALERT_COLOR);
    }

    #[test]
    fn test_missing_font_file() {
        let result = load_font(Path::new("/nonexistent/font.ttf"));
        assert!(matches!(result, Err(OverlayError::Font { .. })));
    }
}
