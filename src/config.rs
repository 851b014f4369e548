use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::geometry::{Calibration, DEFAULT_CM_PER_PX};
use crate::image_input::DEFAULT_MAX_UPLOAD_BYTES;
use crate::report::{DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL, DEFAULT_LLM_TIMEOUT_SECS};
use crate::session::DEFAULT_SESSION_TTL_SECS;
use crate::severity::{SeverityThresholds, DEFAULT_MODERATE_ABOVE_CM3, DEFAULT_SEVERE_ABOVE_CM3};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;
const DEFAULT_API_KEY_ENV: &str = "GROQ_API_KEY";

#[derive(Debug, Deserialize, Default)]
struct ScreeningConfigFile {
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    calibration: Option<CalibrationConfigFile>,
    severity: Option<SeverityConfigFile>,
    llm: Option<LlmConfigFile>,
    report: Option<ReportConfigFile>,
    annotation: Option<AnnotationConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    session_ttl_secs: Option<u64>,
    max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    fixture_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    cm_per_px: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SeverityConfigFile {
    moderate_above_cm3: Option<f64>,
    severe_above_cm3: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct LlmConfigFile {
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportConfigFile {
    fallback_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotationConfigFile {
    enabled: Option<bool>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ScreeningConfig {
    pub api: ApiSettings,
    pub detector: DetectorSettings,
    pub cm_per_px: f64,
    pub moderate_above_cm3: f64,
    pub severe_above_cm3: f64,
    pub llm: LlmConfig,
    pub fallback_dir: Option<PathBuf>,
    pub annotation: AnnotationSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub session_ttl: Duration,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// `stub` or `tract`.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    /// Scripted detections for the stub backend.
    pub fixture_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

#[derive(Debug, Clone)]
pub struct AnnotationSettings {
    pub enabled: bool,
    pub font_path: Option<PathBuf>,
}

impl ScreeningConfig {
    /// Load from `STENOSIS_CONFIG` (JSON, or TOML by `.toml` extension), then
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STENOSIS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file without consulting `STENOSIS_CONFIG`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ScreeningConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let calibration = file.calibration.unwrap_or_default();
        let severity = file.severity.unwrap_or_default();
        let llm = file.llm.unwrap_or_default();
        let report = file.report.unwrap_or_default();
        let annotation = file.annotation.unwrap_or_default();

        Self {
            api: ApiSettings {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                session_ttl: Duration::from_secs(
                    api.session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS),
                ),
                max_upload_bytes: api.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector.model_path,
                fixture_path: detector.fixture_path,
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            },
            cm_per_px: calibration.cm_per_px.unwrap_or(DEFAULT_CM_PER_PX),
            moderate_above_cm3: severity
                .moderate_above_cm3
                .unwrap_or(DEFAULT_MODERATE_ABOVE_CM3),
            severe_above_cm3: severity
                .severe_above_cm3
                .unwrap_or(DEFAULT_SEVERE_ABOVE_CM3),
            llm: LlmConfig {
                base_url: llm
                    .base_url
                    .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
                model: llm.model.unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
                timeout: Duration::from_secs(
                    llm.timeout_secs.unwrap_or(DEFAULT_LLM_TIMEOUT_SECS),
                ),
                api_key_env: llm
                    .api_key_env
                    .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string()),
            },
            fallback_dir: report.fallback_dir,
            annotation: AnnotationSettings {
                enabled: annotation.enabled.unwrap_or(true),
                font_path: annotation.font_path,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("STENOSIS_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(ttl) = non_empty_env("STENOSIS_SESSION_TTL_SECS") {
            let seconds: u64 = ttl.parse().map_err(|_| {
                anyhow!("STENOSIS_SESSION_TTL_SECS must be an integer number of seconds")
            })?;
            self.api.session_ttl = Duration::from_secs(seconds);
        }
        if let Some(backend) = non_empty_env("STENOSIS_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("STENOSIS_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("STENOSIS_DETECTIONS_FIXTURE") {
            self.detector.fixture_path = Some(PathBuf::from(path));
        }
        if let Some(factor) = non_empty_env("STENOSIS_CM_PER_PX") {
            self.cm_per_px = factor
                .parse()
                .map_err(|_| anyhow!("STENOSIS_CM_PER_PX must be a number"))?;
        }
        if let Some(threshold) = non_empty_env("STENOSIS_MODERATE_ABOVE_CM3") {
            self.moderate_above_cm3 = threshold
                .parse()
                .map_err(|_| anyhow!("STENOSIS_MODERATE_ABOVE_CM3 must be a number"))?;
        }
        if let Some(threshold) = non_empty_env("STENOSIS_SEVERE_ABOVE_CM3") {
            self.severe_above_cm3 = threshold
                .parse()
                .map_err(|_| anyhow!("STENOSIS_SEVERE_ABOVE_CM3 must be a number"))?;
        }
        if let Some(url) = non_empty_env("STENOSIS_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = non_empty_env("STENOSIS_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(timeout) = non_empty_env("STENOSIS_LLM_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("STENOSIS_LLM_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.llm.timeout = Duration::from_secs(seconds);
        }
        if let Some(dir) = non_empty_env("STENOSIS_FALLBACK_DIR") {
            self.fallback_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = non_empty_env("STENOSIS_FONT_PATH") {
            self.annotation.font_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.calibration()?;
        self.thresholds()?;

        self.detector.backend = self.detector.backend.trim().to_lowercase();
        match self.detector.backend.as_str() {
            "stub" => {}
            "tract" => {
                if self.detector.model_path.is_none() {
                    return Err(anyhow!("detector backend 'tract' requires model_path"));
                }
            }
            other => return Err(anyhow!("unknown detector backend '{}'", other)),
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        for (name, value) in [
            ("confidence_threshold", self.detector.confidence_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detector {} must be within [0, 1]", name));
            }
        }

        url::Url::parse(&self.llm.base_url)
            .map_err(|e| anyhow!("invalid llm base_url '{}': {}", self.llm.base_url, e))?;
        if self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm model must not be empty"));
        }
        if self.llm.timeout.is_zero() {
            return Err(anyhow!("llm timeout must be greater than zero"));
        }
        if self.api.session_ttl.is_zero() {
            return Err(anyhow!("session ttl must be greater than zero"));
        }
        if self.api.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        Ok(())
    }

    pub fn calibration(&self) -> Result<Calibration> {
        Calibration::new(self.cm_per_px)
    }

    pub fn thresholds(&self) -> Result<SeverityThresholds> {
        SeverityThresholds::new(self.moderate_above_cm3, self.severe_above_cm3)
    }
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self::from_file(ScreeningConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<ScreeningConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
