//! Section and whole-document prompt construction.
//!
//! A prompt is split in two: the fixed part (instructions, outline,
//! section brief) and the context block (summary, reference passages).
//! Only the context block is ever trimmed to fit the budget.

use crate::capability::Passage;
use crate::outline::templates;

/// What a single drafting call is asked to write.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionBrief {
    pub document_title: String,
    /// The user's original request.
    pub document_prompt: String,
    /// Outline rendered as Markdown; empty for whole-document drafts.
    pub outline_markdown: String,
    pub title: String,
    pub bullets: Vec<String>,
    /// 0-based position and section count.
    pub ordinal: usize,
    pub total_sections: usize,
    pub template_id: Option<String>,
}

/// Fixed part of a section prompt. Ends with a newline so the context
/// block can be appended directly.
pub fn build_section_prompt(brief: &SectionBrief) -> String {
    let mut out = String::with_capacity(1024 + brief.outline_markdown.len());

    out.push_str(&format!(
        "You are writing section {} of {} of the document \"{}\".\n",
        brief.ordinal + 1,
        brief.total_sections,
        brief.document_title
    ));
    out.push_str("Document request:\n");
    out.push_str(brief.document_prompt.trim());
    out.push_str("\n\n");

    if !brief.outline_markdown.trim().is_empty() {
        out.push_str("Full outline:\n");
        out.push_str(brief.outline_markdown.trim());
        out.push_str("\n\n");
    }

    out.push_str(&format!("Write the section \"{}\".\n", brief.title));
    if !brief.bullets.is_empty() {
        out.push_str("It must cover:\n");
        for bullet in &brief.bullets {
            out.push_str("- ");
            out.push_str(bullet);
            out.push('\n');
        }
    }
    if let Some(t) = brief.template_id.as_deref().and_then(templates::find) {
        out.push_str(&format!("Style: {}\n", t.style));
    }
    out.push_str(
        "Output only the section body: no heading, no preamble. Stay consistent \
         with what has already been written and do not repeat it.\n",
    );
    out
}

/// Fixed part of the single-shot whole-document prompt.
pub fn build_fallback_prompt(brief: &SectionBrief) -> String {
    let mut out = String::with_capacity(512 + brief.document_prompt.len());
    out.push_str(&format!(
        "Write the complete document \"{}\" in Markdown.\n",
        brief.document_title
    ));
    out.push_str("Use `##` headings for its sections.\n");
    if let Some(t) = brief.template_id.as_deref().and_then(templates::find) {
        out.push_str(&format!(
            "Suggested structure: {}\nStyle: {}\n",
            t.skeleton.join(", "),
            t.style
        ));
    }
    out.push_str("Document request:\n");
    out.push_str(brief.document_prompt.trim());
    out.push('\n');
    out
}

/// Context block: current summary and reference passages.
///
/// Empty parts are omitted entirely, so an empty summary with no passages
/// renders as an empty string.
pub fn render_context(summary: &str, passages: &[Passage]) -> String {
    let mut out = String::new();
    if !summary.trim().is_empty() {
        out.push_str("\nSummary of the document so far:\n");
        out.push_str(summary.trim());
        out.push('\n');
    }
    if !passages.is_empty() {
        out.push_str("\nReference material:\n");
        for p in passages {
            out.push_str(&format!("[{}] {}\n", p.source, p.text.trim()));
        }
    }
    out
}
