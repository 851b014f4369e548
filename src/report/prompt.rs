use serde::Serialize;

use crate::findings::Finding;
use crate::severity::SeverityContext;

/// System persona for the text-generation service.
pub const CLINICAL_PERSONA: &str =
    "You are a senior cardiologist with expertise in angiography and heart disease diagnosis.";

const DIAGNOSIS_TEMPLATE: &str = include_str!("../../templates/diagnosis_prompt.md");

/// A fully rendered, single-shot request. No conversation history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompletionPrompt {
    pub system: String,
    pub user: String,
}

/// Fill the diagnosis template with the findings list and severity narrative.
pub fn render_prompt(findings: &[Finding], context: &SeverityContext) -> CompletionPrompt {
    let findings_json =
        serde_json::to_string_pretty(findings).unwrap_or_else(|_| "[]".to_string());
    let user = DIAGNOSIS_TEMPLATE
        .replace("{image_context}", &context.narrative())
        .replace("{findings}", &findings_json);
    CompletionPrompt {
        system: CLINICAL_PERSONA.to_string(),
        user,
    }
}
