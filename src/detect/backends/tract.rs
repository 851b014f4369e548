#![cfg(feature = "backend-tract")]

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{GenericImageView, Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::image_input::UploadedImage;

/// Inference settings for a YOLO-style ONNX export.
#[derive(Clone, Copy, Debug)]
pub struct TractSettings {
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for TractSettings {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
        }
    }
}

/// Gray used to pad the letterboxed input.
const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);

/// Aspect-preserving fit of a source image into the square model input.
///
/// The image is scaled by one factor and centered; the remainder is padding.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    resized_width: u32,
    resized_height: u32,
    source_width: u32,
    source_height: u32,
}

impl Letterbox {
    fn new(source_width: u32, source_height: u32, input_size: u32) -> Self {
        let scale = input_size as f32 / source_width.max(source_height) as f32;
        let resized_width = ((source_width as f32 * scale) as u32).clamp(1, input_size);
        let resized_height = ((source_height as f32 * scale) as u32).clamp(1, input_size);
        Self {
            scale,
            pad_x: (input_size - resized_width) / 2,
            pad_y: (input_size - resized_height) / 2,
            resized_width,
            resized_height,
            source_width,
            source_height,
        }
    }

    /// Model-input coordinates back to source pixels, clamped to the image.
    fn source_point(&self, x: f32, y: f32) -> (f32, f32) {
        let sx = (x - self.pad_x as f32) / self.scale;
        let sy = (y - self.pad_y as f32) / self.scale;
        (
            sx.clamp(0.0, self.source_width as f32),
            sy.clamp(0.0, self.source_height as f32),
        )
    }
}

/// Tract-based backend for a YOLO stenosis detector exported to ONNX.
///
/// Expects a single output shaped `[1, 4 + classes, boxes]` with center-format
/// boxes in model input pixels. Inputs are letterboxed; boxes are mapped back
/// to the source image, clamped to its bounds and filtered with per-class NMS.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    settings: TractSettings,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, settings: TractSettings) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = settings.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)))
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, settings })
    }

    fn build_input(&self, image: &UploadedImage) -> Result<(Tensor, Letterbox)> {
        let decoded = image::load_from_memory(image.bytes())
            .with_context(|| format!("failed to decode image {}", image.file_name()))?;
        let (width, height) = decoded.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("image {} has no pixels", image.file_name()));
        }

        let size = self.settings.input_size;
        let letterbox = Letterbox::new(width, height, size);
        let resized = decoded
            .resize_exact(letterbox.resized_width, letterbox.resized_height, FilterType::Triangle)
            .to_rgb8();
        let mut canvas = RgbImage::from_pixel(size, size, LETTERBOX_FILL);
        imageops::overlay(
            &mut canvas,
            &resized,
            letterbox.pad_x as i64,
            letterbox.pad_y as i64,
        );

        let edge = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, edge, edge), |(_, channel, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });

        Ok((input.into_tensor(), letterbox))
    }

    fn decode_output(&self, outputs: TVec<TValue>, letterbox: &Letterbox) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a 3-D detection output")?;

        let candidates = decode_predictions(view, letterbox, self.settings.confidence_threshold)?;
        Ok(nms(candidates, self.settings.iou_threshold as f64))
    }
}

/// Decode `[1, 4 + classes, boxes]` predictions above the confidence
/// threshold into source-image detections. No suppression is applied.
fn decode_predictions(
    view: tract_ndarray::ArrayView3<f32>,
    letterbox: &Letterbox,
    confidence_threshold: f32,
) -> Result<Vec<Detection>> {
    let (_, rows, boxes) = view.dim();
    if rows < 5 {
        return Err(anyhow!("detection output has {} rows, expected at least 5", rows));
    }

    let mut candidates = Vec::new();
    for i in 0..boxes {
        let (class_id, score) = (4..rows)
            .map(|row| (row - 4, view[[0, row, i]]))
            .fold((0usize, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score.is_nan() || score <= confidence_threshold {
            continue;
        }
        let cx = view[[0, 0, i]];
        let cy = view[[0, 1, i]];
        let w = view[[0, 2, i]];
        let h = view[[0, 3, i]];

        let (x1, y1) = letterbox.source_point(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.source_point(cx + w / 2.0, cy + h / 2.0);

        candidates.push(Detection {
            x1: x1 as f64,
            y1: y1 as f64,
            x2: x2.max(x1) as f64,
            y2: y2.max(y1) as f64,
            confidence: score.clamp(0.0, 1.0) as f64,
            class_id: class_id as u32,
        });
    }
    Ok(candidates)
}

/// Per-class non-maximum suppression. Output is ordered by descending confidence.
fn nms(detections: Vec<Detection>, iou_threshold: f64) -> Vec<Detection> {
    let mut by_class: HashMap<u32, Vec<Detection>> = HashMap::new();
    for detection in detections {
        by_class.entry(detection.class_id).or_default().push(detection);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            kept.push(group[i]);
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].iou(&group[j]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &UploadedImage) -> Result<DetectionResult> {
        let (input, letterbox) = self.build_input(image)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let detections = self.decode_output(outputs, &letterbox)?;
        log::debug!(
            "tract detector found {} stenosis candidate(s) in {}",
            detections.len(),
            image.file_name()
        );

        Ok(DetectionResult {
            detections,
            image_size: Some((letterbox.source_width, letterbox.source_height)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_suppresses_overlapping_boxes_of_same_class() {
        let strong = Detection::new(0.0, 0.0, 10.0, 10.0, 0.9);
        let weak_overlap = Detection::new(1.0, 1.0, 10.0, 10.0, 0.6);
        let separate = Detection::new(50.0, 50.0, 60.0, 60.0, 0.7);
        let kept = nms(vec![weak_overlap, separate, strong], 0.45);
        assert_eq!(kept, vec![strong, separate]);
    }

    #[test]
    fn letterbox_keeps_aspect_and_centers() {
        let wide = Letterbox::new(1024, 512, 640);
        assert_eq!((wide.resized_width, wide.resized_height), (640, 320));
        assert_eq!((wide.pad_x, wide.pad_y), (0, 160));

        let tall = Letterbox::new(320, 640, 640);
        assert_eq!((tall.resized_width, tall.resized_height), (320, 640));
        assert_eq!((tall.pad_x, tall.pad_y), (160, 0));
    }

    #[test]
    fn predictions_map_back_through_letterbox() {
        let letterbox = Letterbox::new(1024, 512, 640);
        let mut output = tract_ndarray::Array3::<f32>::zeros((1, 5, 3));
        // Kept: 64x32 box centered in the model input.
        for (row, value) in [320.0, 320.0, 64.0, 32.0, 0.9].into_iter().enumerate() {
            output[[0, row, 0]] = value;
        }
        // Below threshold.
        for (row, value) in [100.0, 200.0, 10.0, 10.0, 0.1].into_iter().enumerate() {
            output[[0, row, 1]] = value;
        }
        // Partly in the top padding band; clamped to the image.
        for (row, value) in [20.0, 170.0, 40.0, 40.0, 0.5].into_iter().enumerate() {
            output[[0, row, 2]] = value;
        }

        let detections = decode_predictions(output.view(), &letterbox, 0.25).unwrap();
        assert_eq!(detections.len(), 2);

        let d = detections[0];
        assert!((d.x1 - 460.8).abs() < 1e-3, "x1 {}", d.x1);
        assert!((d.y1 - 230.4).abs() < 1e-3, "y1 {}", d.y1);
        assert!((d.x2 - 563.2).abs() < 1e-3, "x2 {}", d.x2);
        assert!((d.y2 - 281.6).abs() < 1e-3, "y2 {}", d.y2);
        assert!((d.width() / d.height() - 2.0).abs() < 1e-6);
        assert!((d.confidence - 0.9).abs() < 1e-6);

        let clamped = detections[1];
        assert_eq!(clamped.x1, 0.0);
        assert_eq!(clamped.y1, 0.0);
        assert!((clamped.x2 - 64.0).abs() < 1e-3, "x2 {}", clamped.x2);
        assert!((clamped.y2 - 48.0).abs() < 1e-3, "y2 {}", clamped.y2);
    }

    #[test]
    fn predictions_need_box_and_class_rows() {
        let letterbox = Letterbox::new(640, 640, 640);
        let output = tract_ndarray::Array3::<f32>::zeros((1, 4, 2));
        assert!(decode_predictions(output.view(), &letterbox, 0.25).is_err());
    }
}
