//! Presentation adapter: Markdown report to HTML.
//!
//! Report text may come from an external model, so raw HTML blocks and inline
//! HTML in the Markdown are escaped rather than passed through.

use pulldown_cmark::{html, Event, Options, Parser};

use crate::findings::Finding;
use crate::report::{Report, ReportSource};
use crate::severity::SeverityContext;

/// Render CommonMark to an HTML fragment.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

/// Escape text for HTML element content and attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Standalone results page: report, severity summary and findings table.
pub fn results_page(
    file_name: &str,
    findings: &[Finding],
    severity: &SeverityContext,
    report: &Report,
    annotated_href: Option<&str>,
) -> String {
    let mut rows = String::new();
    for (index, finding) in findings.iter().enumerate() {
        let b = finding.bounding_box;
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{:.1}%</td><td>{:.2}</td><td>[{}, {}, {}, {}]</td></tr>\n",
            index + 1,
            escape_html(&finding.condition),
            finding.confidence * 100.0,
            finding.volume_cm3,
            b.x1(),
            b.y1(),
            b.x2(),
            b.y2()
        ));
    }
    let findings_section = if findings.is_empty() {
        "<p>No stenosis detected.</p>".to_string()
    } else {
        format!(
            "<table>\n<thead><tr><th>#</th><th>Condition</th><th>Confidence</th>\
             <th>Volume (cm³)</th><th>Bounding box</th></tr></thead>\n<tbody>\n{}</tbody>\n</table>",
            rows
        )
    };
    let image = annotated_href
        .map(|href| {
            format!(
                "<figure><img src=\"{}\" alt=\"Annotated angiography\"></figure>\n",
                escape_html(href)
            )
        })
        .unwrap_or_default();
    let source_note = match report.source {
        ReportSource::Generated => "",
        ReportSource::Fallback => {
            "<p class=\"note\">Standard report shown; detailed narrative unavailable.</p>\n"
        }
    };

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Stenosis screening: {title}</title>\n</head>\n<body>\n\
         <h1>Stenosis screening: {title}</h1>\n\
         <p>Overall assessment: <strong>{severity}</strong></p>\n\
         {image}{findings}\n{note}<article>\n{report}</article>\n</body>\n</html>\n",
        title = escape_html(file_name),
        severity = severity.severity,
        image = image,
        findings = findings_section,
        note = source_note,
        report = markdown_to_html(&report.markdown),
    )
}
