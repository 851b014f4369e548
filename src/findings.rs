//! Findings extraction.
//!
//! Maps raw detector rows to [`Finding`]s one-to-one, preserving detector
//! output order. Order carries no meaning downstream.
//!
//! Drawing annotations is a side effect kept out of the core: callers that
//! want an annotated image pass an [`AnnotationHook`].

use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::geometry::Calibration;

/// Condition label attached to every finding.
pub const STENOSIS_CONDITION: &str = "Stenosis";

/// Pixel box truncated to integers, serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox(pub [i32; 4]);

impl BoundingBox {
    /// Truncate detector coordinates toward zero.
    pub fn from_detection(detection: &Detection) -> Self {
        Self([
            detection.x1 as i32,
            detection.y1 as i32,
            detection.x2 as i32,
            detection.y2 as i32,
        ])
    }

    pub fn x1(&self) -> i32 {
        self.0[0]
    }

    pub fn y1(&self) -> i32 {
        self.0[1]
    }

    pub fn x2(&self) -> i32 {
        self.0[2]
    }

    pub fn y2(&self) -> i32 {
        self.0[3]
    }
}

/// A detection enriched with a volume estimate. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub condition: String,
    pub confidence: f64,
    pub volume_cm3: f64,
    pub bounding_box: BoundingBox,
}

/// Receives each finding as it is produced, e.g. to draw it onto an image.
pub trait AnnotationHook {
    fn annotate(&mut self, finding: &Finding);
}

/// Hook that does nothing.
pub struct NoAnnotation;

impl AnnotationHook for NoAnnotation {
    fn annotate(&mut self, _finding: &Finding) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FindingsExtractor {
    calibration: Calibration,
}

impl FindingsExtractor {
    pub fn new(calibration: Calibration) -> Self {
        Self { calibration }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn extract(&self, detections: &[Detection]) -> Vec<Finding> {
        self.extract_with_hook(detections, &mut NoAnnotation)
    }

    /// Extract findings and hand each one to `hook` in output order.
    ///
    /// Malformed rows (inverted or negative boxes, confidence outside `[0, 1]`)
    /// are a broken detector contract and trip a debug assertion.
    pub fn extract_with_hook(
        &self,
        detections: &[Detection],
        hook: &mut dyn AnnotationHook,
    ) -> Vec<Finding> {
        let findings: Vec<Finding> = detections
            .iter()
            .map(|detection| {
                debug_assert!(
                    detection.is_well_formed(),
                    "detector returned a malformed row: {detection:?}"
                );
                let finding = Finding {
                    condition: STENOSIS_CONDITION.to_string(),
                    confidence: detection.confidence,
                    volume_cm3: self.calibration.volume_cm3(
                        detection.width(),
                        detection.height(),
                        None,
                    ),
                    bounding_box: BoundingBox::from_detection(detection),
                };
                hook.annotate(&finding);
                finding
            })
            .collect();
        debug_assert_eq!(findings.len(), detections.len());
        findings
    }
}

/// Extract findings with the default calibration.
pub fn extract_stenosis_findings(detections: &[Detection]) -> Vec<Finding> {
    FindingsExtractor::default().extract(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::calculate_stenosis_volume;

    struct Recorder(Vec<BoundingBox>);

    impl AnnotationHook for Recorder {
        fn annotate(&mut self, finding: &Finding) {
            self.0.push(finding.bounding_box);
        }
    }

    #[test]
    fn one_finding_per_detection_in_order() {
        let detections = vec![
            Detection::new(100.0, 100.0, 150.0, 140.0, 0.92),
            Detection::new(10.7, 20.2, 30.9, 25.5, 0.41),
            Detection::new(5.0, 5.0, 5.0, 9.0, 0.33),
        ];
        let findings = extract_stenosis_findings(&detections);
        assert_eq!(findings.len(), detections.len());
        for (finding, detection) in findings.iter().zip(&detections) {
            assert_eq!(finding.condition, "Stenosis");
            assert_eq!(finding.confidence, detection.confidence);
            assert_eq!(
                finding.volume_cm3,
                calculate_stenosis_volume(detection.width(), detection.height(), None)
            );
        }
        assert_eq!(findings[1].bounding_box, BoundingBox([10, 20, 30, 25]));
        assert_eq!(findings[2].volume_cm3, 0.0);
    }

    #[test]
    fn empty_input_yields_no_findings() {
        assert!(extract_stenosis_findings(&[]).is_empty());
    }

    #[test]
    fn hook_sees_every_finding() {
        let detections = vec![
            Detection::new(1.0, 2.0, 3.0, 4.0, 0.5),
            Detection::new(5.0, 6.0, 7.0, 8.0, 0.6),
        ];
        let mut recorder = Recorder(Vec::new());
        let findings = FindingsExtractor::default().extract_with_hook(&detections, &mut recorder);
        assert_eq!(
            recorder.0,
            findings.iter().map(|f| f.bounding_box).collect::<Vec<_>>()
        );
    }

    #[test]
    fn bounding_box_serializes_as_array() {
        let finding = Finding {
            condition: STENOSIS_CONDITION.to_string(),
            confidence: 0.5,
            volume_cm3: 1.0,
            bounding_box: BoundingBox([1, 2, 3, 4]),
        };
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["bounding_box"], serde_json::json!([1, 2, 3, 4]));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "malformed row")]
    fn inverted_box_panics_in_debug() {
        extract_stenosis_findings(&[Detection::new(10.0, 0.0, 5.0, 5.0, 0.5)]);
    }
}
