//! Stenosis screening pipeline.
//!
//! Takes an uploaded medical image through detection, converts the boxes into
//! volume-estimated findings, buckets the total burden into a severity, and
//! produces a Markdown diagnostic report. The report comes from an external
//! text-generation service when one is reachable and from fixed templates
//! otherwise, so every analysis ends with a report.
//!
//! # Module Structure
//!
//! - `image_input`: Upload validation and filename sanitizing
//! - `detect`: Detector seam (backends, registry, detection rows)
//! - `geometry`: Pixel extents to estimated volume
//! - `findings`: Detections to findings
//! - `severity`: Findings to severity bucket and narrative
//! - `report`: Prompt, guarded generation call, fallback templates
//! - `pipeline`: The `Analyzer` tying the stages together
//! - `render`: Markdown to HTML and the results page
//! - `session`: Per-session last analysis
//! - `api`: Local HTTP surface over the pipeline

#[cfg(feature = "annotate")]
pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod findings;
pub mod geometry;
pub mod image_input;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod session;
pub mod severity;
pub mod ui;

pub use config::ScreeningConfig;
pub use detect::{
    BackendRegistry, Detection, DetectionResult, DetectorBackend, StubBackend,
};
pub use findings::{extract_stenosis_findings, BoundingBox, Finding, FindingsExtractor};
pub use geometry::{calculate_stenosis_volume, Calibration};
pub use image_input::UploadedImage;
pub use pipeline::{AnalysisResult, Analyzer};
pub use report::{Report, ReportGenerator, ReportSource};
pub use session::{SessionId, SessionStore};
pub use severity::{Severity, SeverityClassifier, SeverityContext, SeverityThresholds};
