//! Lesion volume estimation from detection boxes.
//!
//! The detector only yields a 2-D box, so the third dimension is approximated
//! as the mean of width and height when no depth is supplied. Pixel volumes are
//! converted to cm³ with a linear pixel-to-centimeter factor cubed.
//!
//! The factor is a calibration constant of the imaging device. The default of
//! 0.1 cm/px is an uncalibrated assumption carried for compatibility; it is
//! injectable through [`Calibration`] and configuration.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Default linear conversion factor (cm per pixel).
pub const DEFAULT_CM_PER_PX: f64 = 0.1;

/// Pixel-to-centimeter calibration for one imaging device.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    cm_per_px: f64,
}

impl Calibration {
    pub fn new(cm_per_px: f64) -> Result<Self> {
        if !cm_per_px.is_finite() || cm_per_px <= 0.0 {
            return Err(anyhow!(
                "cm_per_px must be a positive finite number, got {}",
                cm_per_px
            ));
        }
        Ok(Self { cm_per_px })
    }

    pub fn cm_per_px(&self) -> f64 {
        self.cm_per_px
    }

    /// Volume scale factor (cm³ per px³).
    pub fn cubic_factor(&self) -> f64 {
        self.cm_per_px.powi(3)
    }

    /// Estimate a lesion volume in cm³ from pixel extents.
    ///
    /// `depth` defaults to the mean of `width` and `height`. Zero-area boxes
    /// yield zero volume.
    pub fn volume_cm3(&self, width: f64, height: f64, depth: Option<f64>) -> f64 {
        debug_assert!(
            width >= 0.0 && height >= 0.0,
            "box extents must be non-negative (width={width}, height={height})"
        );
        let depth = depth.unwrap_or((width + height) / 2.0);
        width * height * depth * self.cubic_factor()
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            cm_per_px: DEFAULT_CM_PER_PX,
        }
    }
}

/// Volume estimate using the default calibration.
pub fn calculate_stenosis_volume(width: f64, height: f64, depth: Option<f64>) -> f64 {
    Calibration::default().volume_cm3(width, height, depth)
}
