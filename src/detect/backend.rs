use anyhow::Result;

use crate::detect::result::DetectionResult;
use crate::image_input::UploadedImage;

/// Detector backend trait.
///
/// Backends turn one uploaded image into raw detections. The model itself is
/// external; this seam keeps the findings pipeline independent of it.
///
/// Implementations must:
/// - Treat the image bytes as read-only and ephemeral
/// - Not write the image to disk
/// - Return rows in model output order with pixel coordinates clamped to the image
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an uploaded image.
    fn detect(&mut self, image: &UploadedImage) -> Result<DetectionResult>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
