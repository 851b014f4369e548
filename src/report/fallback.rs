use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Closing line every report carries.
pub const DISCLAIMER: &str = "*This AI analysis is for screening purposes only. Always consult \
with qualified healthcare professionals for medical decisions.*";

pub const HEALTHY_TEMPLATE_FILE: &str = "fallback_healthy.md";
pub const DETECTED_TEMPLATE_FILE: &str = "fallback_detected.md";

const DEFAULT_HEALTHY: &str = include_str!("../../templates/fallback_healthy.md");
const DEFAULT_DETECTED: &str = include_str!("../../templates/fallback_detected.md");

/// The two canned reports used when generation fails.
///
/// Selection depends only on whether any finding exists, so fallbacks carry no
/// per-image detail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackTemplates {
    healthy: String,
    detected: String,
}

impl FallbackTemplates {
    pub fn new(healthy: String, detected: String) -> Result<Self> {
        validate_template("healthy", &healthy)?;
        validate_template("detected", &detected)?;
        Ok(Self { healthy, detected })
    }

    /// Load `fallback_healthy.md` and `fallback_detected.md` from a directory,
    /// e.g. a localized template set.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read fallback template {}", path.display()))
        };
        Self::new(read(HEALTHY_TEMPLATE_FILE)?, read(DETECTED_TEMPLATE_FILE)?)
    }

    pub fn healthy(&self) -> &str {
        &self.healthy
    }

    pub fn detected(&self) -> &str {
        &self.detected
    }

    pub fn select(&self, findings_empty: bool) -> &str {
        if findings_empty {
            &self.healthy
        } else {
            &self.detected
        }
    }
}

impl Default for FallbackTemplates {
    fn default() -> Self {
        Self {
            healthy: DEFAULT_HEALTHY.to_string(),
            detected: DEFAULT_DETECTED.to_string(),
        }
    }
}

fn validate_template(kind: &str, body: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Err(anyhow!("{} fallback template is empty", kind));
    }
    if !super::has_heading(body) {
        return Err(anyhow!("{} fallback template has no markdown heading", kind));
    }
    Ok(())
}
