//! `scribe check` command: run the coherence checker over a Markdown file.

use std::path::Path;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use scribe_core::coherence::{CheckedSection, CoherenceChecker, CoherenceConfig};

/// Split a Markdown document into sections at its headings.
///
/// A leading H1 is the document title, not a section. Text before the
/// first section heading becomes a section of its own when non-blank.
pub fn split_sections(markdown: &str) -> Vec<CheckedSection> {
    let mut sections: Vec<CheckedSection> = Vec::new();
    let mut title = String::new();
    let mut body = String::new();
    let mut seen_heading = false;
    let mut in_fence = false;

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let parsed = if in_fence { None } else { heading(line) };
        match parsed {
            Some((1, _)) if !seen_heading && body.trim().is_empty() => {
                seen_heading = true;
            }
            Some((_, text)) => {
                seen_heading = true;
                flush(&mut title, &mut body, &mut sections);
                title = text.to_string();
            }
            None => {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    flush(&mut title, &mut body, &mut sections);
    sections
}

fn flush(title: &mut String, body: &mut String, sections: &mut Vec<CheckedSection>) {
    if !title.is_empty() || !body.trim().is_empty() {
        let ordinal = sections.len();
        sections.push(CheckedSection {
            ordinal,
            title: std::mem::take(title),
            text: body.trim().to_string(),
        });
    }
    body.clear();
}

/// `(level, text)` for an ATX heading line.
fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    Some((level, rest.trim().trim_end_matches('#').trim()))
}

/// Run the check command.
pub fn run_check(path: &Path, config: CoherenceConfig, json: bool) -> Result<()> {
    let markdown = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let sections = split_sections(&markdown);
    if sections.is_empty() {
        bail!("{} has no sections to check", path.display());
    }

    let report = CoherenceChecker::new(config)
        .check(Uuid::new_v4(), &sections)
        .context("coherence check failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Sections checked: {}", report.sections_checked);
        println!("Score: {:.2}", report.score);
        if report.flags.is_empty() {
            println!("No inconsistencies flagged.");
        } else {
            println!("Flags:");
            for flag in &report.flags {
                let name = |i: usize| {
                    sections
                        .get(i)
                        .map_or_else(|| format!("#{}", i + 1), |s| format!("{:?}", s.title))
                };
                println!(
                    "  - {} / {}: {}",
                    name(flag.section_a),
                    name(flag.section_b),
                    flag.reason
                );
            }
        }
    }

    if config.block_on_flags && !report.flags.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
