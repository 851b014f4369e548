use anyhow::{Context, Result};
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::image_input::UploadedImage;

/// Stub backend for testing and offline runs.
///
/// Returns the same scripted detections for every image. Scripts can be loaded
/// from a JSON array of detection rows.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<Detection>,
}

impl StubBackend {
    /// Backend that never detects anything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    /// Load scripted detections from a JSON fixture file.
    pub fn from_fixture<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detections fixture {}", path.display()))?;
        let detections: Vec<Detection> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid detections fixture {}", path.display()))?;
        Ok(Self { detections })
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &UploadedImage) -> Result<DetectionResult> {
        log::debug!(
            "stub detector returning {} scripted detection(s) for {}",
            self.detections.len(),
            image.file_name()
        );
        Ok(DetectionResult {
            detections: self.detections.clone(),
            image_size: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stub_backend_replays_script() {
        let image = UploadedImage::new("scan.png", vec![1, 2, 3]).unwrap();
        let mut empty = StubBackend::new();
        assert!(empty.detect(&image).unwrap().detections.is_empty());

        let row = Detection::new(1.0, 2.0, 3.0, 4.0, 0.7);
        let mut scripted = StubBackend::with_detections(vec![row]);
        let first = scripted.detect(&image).unwrap();
        let second = scripted.detect(&image).unwrap();
        assert_eq!(first.detections, vec![row]);
        assert_eq!(second.detections, vec![row]);
    }

    #[test]
    fn loads_fixture_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[{"x1":100,"y1":100,"x2":150,"y2":140,"confidence":0.92,"class_id":0}]"#,
        )
        .unwrap();
        let backend = StubBackend::from_fixture(file.path()).unwrap();
        assert_eq!(
            backend.detections,
            vec![Detection::new(100.0, 100.0, 150.0, 140.0, 0.92)]
        );

        std::fs::write(file.path(), b"not json").unwrap();
        assert!(StubBackend::from_fixture(file.path()).is_err());
    }
}
