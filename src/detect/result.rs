use serde::{Deserialize, Serialize};

/// Class index the stenosis model assigns to stenosis boxes.
pub const STENOSIS_CLASS_ID: u32 = 0;

/// One raw detector output row.
///
/// Coordinates are pixels in the source image with `x2 >= x1` and `y2 >= y1`.
/// Immutable once produced; scoped to one inference call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub class_id: u32,
}

impl Detection {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64, confidence: f64) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id: STENOSIS_CLASS_ID,
        }
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// True when the row satisfies the detector contract.
    pub fn is_well_formed(&self) -> bool {
        self.x1 >= 0.0
            && self.y1 >= 0.0
            && self.x2 >= self.x1
            && self.y2 >= self.y1
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Result of running the detector on one uploaded image.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    /// Detections in detector output order.
    pub detections: Vec<Detection>,
    /// Decoded image size, when the backend decoded the image.
    pub image_size: Option<(u32, u32)>,
}
