//! End-to-end screening pipeline.
//!
//! image → detector → findings (+ optional annotation) → severity → report.
//! Each call is synchronous and self-contained; the analyzer keeps no
//! per-request state.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

#[cfg(feature = "annotate")]
use std::sync::Arc;

use crate::config::ScreeningConfig;
use crate::detect::{BackendRegistry, DetectionResult, DetectorBackend, StubBackend};
use crate::findings::{Finding, FindingsExtractor};
use crate::geometry::Calibration;
use crate::image_input::UploadedImage;
use crate::report::{
    ApiKey, ChatCompletionClient, FallbackTemplates, LlmSettings, OfflineGenerator, Report,
    ReportGenerator, TextGenerator,
};
use crate::severity::{SeverityClassifier, SeverityContext, SeverityThresholds};

/// Reference to the uploaded image. The bytes themselves are not retained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageArtifact {
    pub file_name: String,
    pub sha256: String,
    pub byte_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<(u32, u32)>,
}

/// Annotated copy of the upload, JPEG encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnnotatedArtifact {
    pub file_name: String,
    #[serde(skip)]
    pub jpeg: Vec<u8>,
}

/// Everything produced for one uploaded image.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisResult {
    pub image: ImageArtifact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated: Option<AnnotatedArtifact>,
    pub findings: Vec<Finding>,
    pub severity: SeverityContext,
    pub report: Report,
}

pub struct Analyzer {
    detectors: BackendRegistry,
    extractor: FindingsExtractor,
    classifier: SeverityClassifier,
    reporter: ReportGenerator,
    annotate: bool,
    #[cfg(feature = "annotate")]
    font: Option<Arc<ab_glyph::FontVec>>,
}

impl Analyzer {
    pub fn new(detectors: BackendRegistry, reporter: ReportGenerator) -> Self {
        Self {
            detectors,
            extractor: FindingsExtractor::default(),
            classifier: SeverityClassifier::default(),
            reporter,
            annotate: cfg!(feature = "annotate"),
            #[cfg(feature = "annotate")]
            font: None,
        }
    }

    /// Analyzer with a single detector backend.
    pub fn with_backend<B: DetectorBackend + 'static>(backend: B, reporter: ReportGenerator) -> Self {
        let mut detectors = BackendRegistry::new();
        detectors.register(backend);
        Self::new(detectors, reporter)
    }

    /// Empty stub detector and no text-generation service.
    pub fn offline() -> Self {
        Self::with_backend(StubBackend::new(), ReportGenerator::offline())
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.extractor = FindingsExtractor::new(calibration);
        self
    }

    pub fn with_reporter(mut self, reporter: ReportGenerator) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_thresholds(mut self, thresholds: SeverityThresholds) -> Self {
        self.classifier = SeverityClassifier::new(thresholds);
        self
    }

    /// Enable or disable the annotated image artifact.
    ///
    /// Without the `annotate` feature this is always off.
    pub fn with_annotation(mut self, enabled: bool) -> Self {
        self.annotate = enabled && cfg!(feature = "annotate");
        self
    }

    #[cfg(feature = "annotate")]
    pub fn with_label_font(mut self, font: Arc<ab_glyph::FontVec>) -> Self {
        self.font = Some(font);
        self
    }

    /// Build the full pipeline from configuration.
    pub fn from_config(cfg: &ScreeningConfig) -> Result<Self> {
        let detectors = build_detectors(cfg)?;
        let generator = build_generator(cfg)?;
        let fallbacks = match &cfg.fallback_dir {
            Some(dir) => FallbackTemplates::from_dir(dir)?,
            None => FallbackTemplates::default(),
        };
        let reporter = ReportGenerator::with_fallbacks(generator, fallbacks);

        #[allow(unused_mut)]
        let mut analyzer = Self::new(detectors, reporter)
            .with_calibration(cfg.calibration()?)
            .with_thresholds(cfg.thresholds()?)
            .with_annotation(cfg.annotation.enabled);

        #[cfg(feature = "annotate")]
        if let Some(path) = &cfg.annotation.font_path {
            analyzer = analyzer.with_label_font(crate::annotate::load_font(path)?);
        }
        #[cfg(not(feature = "annotate"))]
        if cfg.annotation.enabled {
            log::info!("annotation requested but this build lacks the 'annotate' feature");
        }

        Ok(analyzer)
    }

    pub fn detectors(&self) -> &BackendRegistry {
        &self.detectors
    }

    pub fn reporter(&self) -> &ReportGenerator {
        &self.reporter
    }

    pub fn classifier(&self) -> &SeverityClassifier {
        &self.classifier
    }

    /// Run the whole pipeline for one upload.
    ///
    /// Only detector failures (e.g. an undecodable image) are errors. Zero
    /// detections and text-generation failures are normal outcomes.
    pub fn analyze(&self, image: &UploadedImage) -> Result<AnalysisResult> {
        let detection = self
            .detectors
            .detect(image)
            .with_context(|| format!("detector rejected {}", image.file_name()))?;
        Ok(self.analyze_detections(image, detection))
    }

    /// Run everything after detection.
    pub fn analyze_detections(
        &self,
        image: &UploadedImage,
        detection: DetectionResult,
    ) -> AnalysisResult {
        let (findings, annotated) = self.extract(image, &detection);
        let severity = self.classifier.classify(&findings);
        let report = self.reporter.generate(&findings, &severity);
        log::info!(
            "analyzed {}: {} finding(s), severity {}, report {:?}",
            image.file_name(),
            findings.len(),
            severity.severity,
            report.source
        );

        AnalysisResult {
            image: ImageArtifact {
                file_name: image.file_name().to_string(),
                sha256: image.sha256_hex(),
                byte_len: image.bytes().len(),
                dimensions: detection.image_size,
            },
            annotated,
            findings,
            severity,
            report,
        }
    }

    #[cfg(feature = "annotate")]
    fn extract(
        &self,
        image: &UploadedImage,
        detection: &DetectionResult,
    ) -> (Vec<Finding>, Option<AnnotatedArtifact>) {
        use crate::annotate::ImageAnnotator;

        if self.annotate {
            match ImageAnnotator::from_image(image, self.font.clone()) {
                Ok(mut annotator) => {
                    let findings = self
                        .extractor
                        .extract_with_hook(&detection.detections, &mut annotator);
                    let annotated = match annotator.finish_jpeg() {
                        Ok(jpeg) => Some(AnnotatedArtifact {
                            file_name: image.annotated_file_name(),
                            jpeg,
                        }),
                        Err(err) => {
                            log::warn!("annotated image for {} not produced: {:#}", image.file_name(), err);
                            None
                        }
                    };
                    return (findings, annotated);
                }
                Err(err) => {
                    log::warn!("annotation skipped for {}: {:#}", image.file_name(), err);
                }
            }
        }
        (self.extractor.extract(&detection.detections), None)
    }

    #[cfg(not(feature = "annotate"))]
    fn extract(
        &self,
        _image: &UploadedImage,
        detection: &DetectionResult,
    ) -> (Vec<Finding>, Option<AnnotatedArtifact>) {
        (self.extractor.extract(&detection.detections), None)
    }
}

fn build_detectors(cfg: &ScreeningConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    match cfg.detector.backend.as_str() {
        "stub" => {
            let backend = match &cfg.detector.fixture_path {
                Some(path) => StubBackend::from_fixture(path)?,
                None => StubBackend::new(),
            };
            log::warn!("using stub detector backend; detections are scripted");
            registry.register(backend);
        }
        "tract" => register_tract(&mut registry, cfg)?,
        other => return Err(anyhow!("unknown detector backend '{}'", other)),
    }
    registry.warm_up_all()?;
    Ok(registry)
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut BackendRegistry, cfg: &ScreeningConfig) -> Result<()> {
    use crate::detect::{TractBackend, TractSettings};

    let model_path = cfg
        .detector
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("detector backend 'tract' requires model_path"))?;
    let settings = TractSettings {
        input_size: cfg.detector.input_size,
        confidence_threshold: cfg.detector.confidence_threshold,
        iou_threshold: cfg.detector.iou_threshold,
    };
    registry.register(TractBackend::new(model_path, settings)?);
    log::info!("loaded stenosis detector model {}", model_path.display());
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(_registry: &mut BackendRegistry, _cfg: &ScreeningConfig) -> Result<()> {
    Err(anyhow!(
        "detector backend 'tract' requires building with the 'backend-tract' feature"
    ))
}

fn build_generator(cfg: &ScreeningConfig) -> Result<Box<dyn TextGenerator>> {
    match ApiKey::from_env(&cfg.llm.api_key_env) {
        Some(key) => {
            let settings = LlmSettings {
                base_url: cfg.llm.base_url.clone(),
                model: cfg.llm.model.clone(),
                timeout: cfg.llm.timeout,
            };
            let client = ChatCompletionClient::new(&settings, key)?;
            log::info!(
                "report generation via {} (timeout {}s)",
                client.endpoint(),
                cfg.llm.timeout.as_secs()
            );
            Ok(Box::new(client))
        }
        None => {
            log::warn!(
                "{} is not set; reports will use the standard fallback text",
                cfg.llm.api_key_env
            );
            Ok(Box::new(OfflineGenerator))
        }
    }
}
