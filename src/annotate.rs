#![cfg(feature = "annotate")]
//! Annotation collaborator.
//!
//! Draws each finding onto a copy of the uploaded image: a red 2px rectangle
//! and, when a font is configured, a `Stenosis 0.92` label 10px above the box.
//! The result is encoded as JPEG. The original upload is never modified.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::findings::{AnnotationHook, Finding};
use crate::image_input::UploadedImage;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_OFFSET_PX: i32 = 10;
const LABEL_SCALE: f32 = 16.0;

/// Load a TrueType/OpenType font for labels.
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<Arc<FontVec>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read label font {}", path.display()))?;
    let font = FontVec::try_from_vec(bytes)
        .map_err(|e| anyhow!("invalid label font {}: {}", path.display(), e))?;
    Ok(Arc::new(font))
}

/// Draws findings onto a decoded copy of an upload.
pub struct ImageAnnotator {
    canvas: RgbImage,
    font: Option<Arc<FontVec>>,
    drawn: usize,
}

impl ImageAnnotator {
    pub fn from_image(image: &UploadedImage, font: Option<Arc<FontVec>>) -> Result<Self> {
        let decoded = image::load_from_memory(image.bytes())
            .with_context(|| format!("failed to decode image {}", image.file_name()))?;
        Ok(Self {
            canvas: decoded.to_rgb8(),
            font,
            drawn: 0,
        })
    }

    /// Number of findings drawn so far.
    pub fn drawn(&self) -> usize {
        self.drawn
    }

    /// Encode the annotated copy as JPEG.
    pub fn finish_jpeg(self) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(self.canvas)
            .write_to(&mut out, ImageFormat::Jpeg)
            .context("failed to encode annotated image")?;
        Ok(out.into_inner())
    }

    fn draw_box(&mut self, finding: &Finding) {
        let b = finding.bounding_box;
        let width = (b.x2() - b.x1()).max(1) as u32;
        let height = (b.y2() - b.y1()).max(1) as u32;
        for offset in 0..BOX_THICKNESS {
            let rect = Rect::at(b.x1() - offset, b.y1() - offset)
                .of_size(width + 2 * offset as u32, height + 2 * offset as u32);
            draw_hollow_rect_mut(&mut self.canvas, rect, BOX_COLOR);
        }
    }

    fn draw_label(&mut self, finding: &Finding) {
        let Some(font) = self.font.clone() else {
            return;
        };
        let label = format!("{} {:.2}", finding.condition, finding.confidence);
        let scale = PxScale::from(LABEL_SCALE);
        let (_, text_height) = text_size(scale, font.as_ref(), &label);
        let b = finding.bounding_box;
        let y = (b.y1() - LABEL_OFFSET_PX - text_height as i32).max(0);
        draw_text_mut(&mut self.canvas, BOX_COLOR, b.x1(), y, scale, font.as_ref(), &label);
    }
}

impl AnnotationHook for ImageAnnotator {
    fn annotate(&mut self, finding: &Finding) {
        self.draw_box(finding);
        self.draw_label(finding);
        self.drawn += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use crate::findings::FindingsExtractor;

    fn gray_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn draws_rectangle_for_each_finding() {
        let upload = UploadedImage::new("scan.png", gray_png(200, 200)).unwrap();
        let mut annotator = ImageAnnotator::from_image(&upload, None).unwrap();
        let detections = vec![
            Detection::new(100.0, 100.0, 150.0, 140.0, 0.92),
            Detection::new(10.0, 10.0, 10.0, 10.0, 0.5),
        ];
        let findings = FindingsExtractor::default().extract_with_hook(&detections, &mut annotator);
        assert_eq!(findings.len(), 2);
        assert_eq!(annotator.drawn(), 2);

        let jpeg = annotator.finish_jpeg().unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (200, 200));
        let edge = decoded.get_pixel(125, 100);
        assert!(edge[0] as i32 - edge[1] as i32 > 60, "edge pixel {:?}", edge);
        let inside = decoded.get_pixel(125, 120);
        assert!((inside[0] as i32 - inside[1] as i32).abs() < 30, "inside pixel {:?}", inside);
    }

    #[test]
    fn undecodable_upload_is_an_error() {
        let upload = UploadedImage::new("scan.png", b"not an image".to_vec()).unwrap();
        assert!(ImageAnnotator::from_image(&upload, None).is_err());
    }
}
