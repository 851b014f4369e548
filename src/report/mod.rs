//! Clinical report generation.
//!
//! The primary path renders the diagnosis prompt and asks a text-generation
//! service for a Markdown report. Every failure of that service (timeout,
//! transport, status, malformed or unusable content) resolves to one of two
//! canned fallback reports; nothing propagates to the caller.
//!
//! The service call is expressed as a [`Generation`] outcome so the fallback
//! branch is explicit and testable.

mod fallback;
mod llm;
mod prompt;

use serde::{Deserialize, Serialize};

use crate::findings::Finding;
use crate::severity::SeverityContext;

pub use fallback::{
    FallbackTemplates, DETECTED_TEMPLATE_FILE, DISCLAIMER, HEALTHY_TEMPLATE_FILE,
};
pub use llm::{
    ApiKey, ChatCompletionClient, GenerationFailure, LlmSettings, OfflineGenerator, TextGenerator,
    DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL, DEFAULT_LLM_TIMEOUT_SECS,
};
pub use prompt::{render_prompt, CompletionPrompt, CLINICAL_PERSONA};

/// Where a report's text came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    Generated,
    Fallback,
}

/// A Markdown report. Never empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub markdown: String,
    pub source: ReportSource,
}

/// Outcome of one guarded call to the text-generation service.
#[derive(Debug, PartialEq, Eq)]
pub enum Generation {
    Completed(String),
    Failed(GenerationFailure),
}

pub struct ReportGenerator {
    generator: Box<dyn TextGenerator>,
    fallbacks: FallbackTemplates,
}

impl ReportGenerator {
    pub fn new(generator: Box<dyn TextGenerator>) -> Self {
        Self::with_fallbacks(generator, FallbackTemplates::default())
    }

    pub fn with_fallbacks(generator: Box<dyn TextGenerator>, fallbacks: FallbackTemplates) -> Self {
        Self {
            generator,
            fallbacks,
        }
    }

    /// Generator that never contacts a service.
    pub fn offline() -> Self {
        Self::new(Box::new(OfflineGenerator))
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub fn fallbacks(&self) -> &FallbackTemplates {
        &self.fallbacks
    }

    /// Produce the report for a findings sequence and its severity context.
    pub fn generate(&self, findings: &[Finding], context: &SeverityContext) -> Report {
        debug_assert_eq!(findings.len(), context.finding_count);
        let prompt = render_prompt(findings, context);
        match self.attempt(&prompt) {
            Generation::Completed(markdown) => Report {
                markdown,
                source: ReportSource::Generated,
            },
            Generation::Failed(failure) => {
                log::warn!(
                    "report generation via '{}' failed, using fallback report: {}",
                    self.generator.name(),
                    failure
                );
                Report {
                    markdown: self.fallbacks.select(findings.is_empty()).to_string(),
                    source: ReportSource::Fallback,
                }
            }
        }
    }

    /// Call the service once and vet its output.
    pub fn attempt(&self, prompt: &CompletionPrompt) -> Generation {
        match self
            .generator
            .complete(prompt)
            .and_then(|text| accept_completion(&text))
        {
            Ok(markdown) => Generation::Completed(markdown),
            Err(failure) => Generation::Failed(failure),
        }
    }
}

/// Normalize a completion into a report, or reject it.
///
/// A single wrapping code fence is removed, along with any text after its
/// closing line. The body must contain a Markdown
/// heading. The screening disclaimer is appended when missing.
pub fn accept_completion(text: &str) -> Result<String, GenerationFailure> {
    let body = strip_code_fence(text.trim()).trim();
    if body.is_empty() {
        return Err(GenerationFailure::Unusable("empty completion".to_string()));
    }
    if !has_heading(body) {
        return Err(GenerationFailure::Unusable(
            "completion has no markdown headings".to_string(),
        ));
    }
    let mut markdown = body.to_string();
    if !markdown.contains(DISCLAIMER) {
        markdown.push_str("\n\n---\n");
        markdown.push_str(DISCLAIMER);
    }
    markdown.push('\n');
    Ok(markdown)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some((_, inner)) = rest.split_once('\n') else {
        return text;
    };
    // The last bare fence line closes the wrapper; anything after it is
    // chatter outside the report.
    let mut closing = None;
    let mut offset = 0;
    for line in inner.split_inclusive('\n') {
        if line.trim() == "```" {
            closing = Some(offset);
        }
        offset += line.len();
    }
    match closing {
        Some(end) => &inner[..end],
        None => inner,
    }
}

pub(crate) fn has_heading(markdown: &str) -> bool {
    markdown.lines().any(|line| {
        let hashes = line.trim_start().chars().take_while(|c| *c == '#').count();
        (1..=6).contains(&hashes)
            && line
                .trim_start()
                .chars()
                .nth(hashes)
                .is_some_and(|c| c == ' ')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::{BoundingBox, STENOSIS_CONDITION};
    use crate::severity::SeverityClassifier;

    struct Scripted(Result<String, GenerationFailure>);

    impl TextGenerator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn complete(&self, _prompt: &CompletionPrompt) -> Result<String, GenerationFailure> {
            self.0.clone()
        }
    }

    fn one_finding() -> Vec<Finding> {
        vec![Finding {
            condition: STENOSIS_CONDITION.to_string(),
            confidence: 0.92,
            volume_cm3: 90.0,
            bounding_box: BoundingBox([100, 100, 150, 140]),
        }]
    }

    fn generate_with(result: Result<String, GenerationFailure>, findings: &[Finding]) -> Report {
        let ctx = SeverityClassifier::default().classify(findings);
        ReportGenerator::new(Box::new(Scripted(result))).generate(findings, &ctx)
    }

    #[test]
    fn failing_service_yields_exact_fallbacks() {
        let templates = FallbackTemplates::default();
        for failure in [
            GenerationFailure::TimedOut,
            GenerationFailure::NotConfigured,
            GenerationFailure::Service {
                status: 503,
                message: "overloaded".to_string(),
            },
            GenerationFailure::Malformed("eof".to_string()),
        ] {
            let healthy = generate_with(Err(failure.clone()), &[]);
            assert_eq!(healthy.markdown, templates.healthy());
            assert_eq!(healthy.source, ReportSource::Fallback);

            let detected = generate_with(Err(failure), &one_finding());
            assert_eq!(detected.markdown, templates.detected());
            assert_eq!(detected.source, ReportSource::Fallback);
        }
    }

    #[test]
    fn unusable_completion_falls_back() {
        let report = generate_with(Ok("   ".to_string()), &one_finding());
        assert_eq!(report.source, ReportSource::Fallback);
        let report = generate_with(Ok("I cannot help with that.".to_string()), &[]);
        assert_eq!(report.markdown, FallbackTemplates::default().healthy());
    }

    #[test]
    fn accepted_completion_gets_disclaimer() {
        let report = generate_with(
            Ok("## Executive Summary\nSevere stenosis.".to_string()),
            &one_finding(),
        );
        assert_eq!(report.source, ReportSource::Generated);
        assert!(report.markdown.starts_with("## Executive Summary"));
        assert!(report.markdown.trim_end().ends_with(DISCLAIMER));
    }

    #[test]
    fn accept_completion_strips_fence_and_keeps_existing_disclaimer() {
        let fenced = format!("```markdown\n## Executive Summary\nok\n\n{}\n```", DISCLAIMER);
        let accepted = accept_completion(&fenced).unwrap();
        assert!(accepted.starts_with("## Executive Summary"));
        assert_eq!(accepted.matches(DISCLAIMER).count(), 1);
        assert!(!accepted.contains("```"));
    }

    #[test]
    fn accept_completion_drops_text_after_closing_fence() {
        let accepted = accept_completion("```\n## A\nbody\n```\ntrailing").unwrap();
        assert!(accepted.starts_with("## A\nbody\n"));
        assert!(!accepted.contains("```"));
        assert!(!accepted.contains("trailing"));
        assert!(accepted.trim_end().ends_with(DISCLAIMER));

        let nested = "```markdown\n## A\n```text\nx\n```\nmore\n```\nThanks!";
        let accepted = accept_completion(nested).unwrap();
        assert!(accepted.starts_with("## A\n```text\nx\n```\nmore\n"));
        assert!(!accepted.contains("Thanks!"));

        let unterminated = accept_completion("```markdown\n## A\nbody").unwrap();
        assert!(unterminated.starts_with("## A\nbody"));
    }

    #[test]
    fn heading_detection() {
        assert!(has_heading("intro\n## Section\nbody"));
        assert!(has_heading("# Title"));
        assert!(!has_heading("#hashtag"));
        assert!(!has_heading("####### seven"));
        assert!(!has_heading("no headings here"));
    }
}
