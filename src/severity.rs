//! Severity classification over a findings sequence.
//!
//! An empty sequence is the healthy path; aggregates are only computed when
//! at least one finding exists. Buckets use strict `>` on total volume.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::findings::Finding;

pub const DEFAULT_MODERATE_ABOVE_CM3: f64 = 0.5;
pub const DEFAULT_SEVERE_ABOVE_CM3: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Healthy,
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Healthy => "healthy",
            Severity::Mild => "mild",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total-volume cut points. Uncalibrated defaults; inject per deployment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    moderate_above_cm3: f64,
    severe_above_cm3: f64,
}

impl SeverityThresholds {
    pub fn new(moderate_above_cm3: f64, severe_above_cm3: f64) -> Result<Self> {
        if !moderate_above_cm3.is_finite() || !severe_above_cm3.is_finite() {
            return Err(anyhow!("severity thresholds must be finite"));
        }
        if moderate_above_cm3 < 0.0 {
            return Err(anyhow!("moderate threshold must be >= 0"));
        }
        if moderate_above_cm3 >= severe_above_cm3 {
            return Err(anyhow!(
                "moderate threshold ({}) must be below severe threshold ({})",
                moderate_above_cm3,
                severe_above_cm3
            ));
        }
        Ok(Self {
            moderate_above_cm3,
            severe_above_cm3,
        })
    }

    pub fn moderate_above_cm3(&self) -> f64 {
        self.moderate_above_cm3
    }

    pub fn severe_above_cm3(&self) -> f64 {
        self.severe_above_cm3
    }

    /// Bucket a non-empty sequence by its total volume.
    pub fn bucket(&self, total_volume_cm3: f64) -> Severity {
        if total_volume_cm3 > self.severe_above_cm3 {
            Severity::Severe
        } else if total_volume_cm3 > self.moderate_above_cm3 {
            Severity::Moderate
        } else {
            Severity::Mild
        }
    }
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            moderate_above_cm3: DEFAULT_MODERATE_ABOVE_CM3,
            severe_above_cm3: DEFAULT_SEVERE_ABOVE_CM3,
        }
    }
}

/// Aggregate view of one findings sequence. Computed on demand, never stored
/// apart from the analysis it describes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeverityContext {
    pub severity: Severity,
    pub finding_count: usize,
    /// `None` on the healthy path.
    pub total_volume_cm3: Option<f64>,
    /// `None` on the healthy path.
    pub avg_confidence: Option<f64>,
}

impl SeverityContext {
    pub fn healthy() -> Self {
        Self {
            severity: Severity::Healthy,
            finding_count: 0,
            total_volume_cm3: None,
            avg_confidence: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.finding_count == 0
    }

    /// Plain-language summary handed to the report prompt.
    pub fn narrative(&self) -> String {
        match (self.total_volume_cm3, self.avg_confidence) {
            (Some(total), Some(avg)) if !self.is_healthy() => format!(
                "The AI analysis detected {} stenosis area(s) with {} severity. \
                 Total estimated volume: {:.2} cm³. Average confidence: {:.1}%.",
                self.finding_count,
                self.severity,
                total,
                avg * 100.0
            ),
            _ => "The AI analysis detected NO signs of stenosis in this angiography image. \
                  The image appears to be from a healthy individual with normal coronary \
                  artery structure."
                .to_string(),
        }
    }
}

/// Pure classifier: the same findings always produce the same context.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeverityClassifier {
    thresholds: SeverityThresholds,
}

impl SeverityClassifier {
    pub fn new(thresholds: SeverityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> SeverityThresholds {
        self.thresholds
    }

    pub fn classify(&self, findings: &[Finding]) -> SeverityContext {
        if findings.is_empty() {
            return SeverityContext::healthy();
        }
        let total: f64 = findings.iter().map(|f| f.volume_cm3).sum();
        let avg = findings.iter().map(|f| f.confidence).sum::<f64>() / findings.len() as f64;
        SeverityContext {
            severity: self.thresholds.bucket(total),
            finding_count: findings.len(),
            total_volume_cm3: Some(total),
            avg_confidence: Some(avg),
        }
    }
}
