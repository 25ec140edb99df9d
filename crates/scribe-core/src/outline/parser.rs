//! Markdown outline parser.
//!
//! Parses the planner's Markdown reply into an [`Outline`]:
//! - `#`, `##`, `###` headings become nodes (deeper levels clamp to H3).
//! - `-`, `*`, `+` and `1.`/`1)` list items become bullets of the current
//!   heading; bullets before the first heading are ignored.
//! - Code fence lines are dropped, their contents parsed normally.
//! - A single leading H1 followed only by deeper headings is the title.

use scribe_store::models::{HeadingLevel, Outline, OutlineNode};
use thiserror::Error;

/// Errors from outline parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutlineParseError {
    #[error("outline contains no headings")]
    NoHeadings,
}

struct FlatHeading {
    depth: usize,
    title: String,
    bullets: Vec<String>,
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    (!title.is_empty()).then_some((hashes, title))
}

fn bullet(line: &str) -> Option<&str> {
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim());
        }
    }
    None
}

/// Strip inline emphasis markers the model likes to add to headings.
fn clean(text: &str) -> String {
    text.trim_matches(|c| c == '*' || c == '_' || c == '`')
        .trim()
        .to_string()
}

/// Parse a Markdown outline.
///
/// `fallback_title` is used when the outline has no title heading.
pub fn parse_outline(
    markdown: &str,
    fallback_title: &str,
    template_id: Option<String>,
) -> Result<Outline, OutlineParseError> {
    let mut flat: Vec<FlatHeading> = Vec::new();

    for raw in markdown.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("```") || line.starts_with("~~~") {
            continue;
        }
        if let Some((depth, title)) = heading(line) {
            flat.push(FlatHeading {
                depth,
                title: clean(title),
                bullets: Vec::new(),
            });
        } else if let Some(text) = bullet(line) {
            if let Some(current) = flat.last_mut() {
                if !text.is_empty() {
                    current.bullets.push(clean(text));
                }
            }
        }
    }

    if flat.is_empty() {
        return Err(OutlineParseError::NoHeadings);
    }

    // A lone leading H1 over deeper headings is the document title.
    let mut title = fallback_title.to_string();
    let h1_count = flat.iter().filter(|h| h.depth == 1).count();
    if flat.len() > 1 && flat[0].depth == 1 && h1_count == 1 {
        let head = flat.remove(0);
        title = head.title;
    }

    let nodes = build_tree(flat);
    Ok(Outline::new(title, template_id, nodes))
}

/// Nest flat headings by depth. A heading becomes a child of the nearest
/// preceding heading with a smaller depth; orphans stay at the top level.
fn build_tree(flat: Vec<FlatHeading>) -> Vec<OutlineNode> {
    // Stack of (depth, node) along the current path.
    let mut stack: Vec<(usize, OutlineNode)> = Vec::new();
    let mut roots: Vec<OutlineNode> = Vec::new();

    fn attach(stack: &mut Vec<(usize, OutlineNode)>, roots: &mut Vec<OutlineNode>) {
        if let Some((_, node)) = stack.pop() {
            match stack.last_mut() {
                Some((_, parent)) => parent.children.push(node),
                None => roots.push(node),
            }
        }
    }

    for h in flat {
        let depth = h.depth;
        while stack.last().is_some_and(|(d, _)| *d >= depth) {
            attach(&mut stack, &mut roots);
        }
        // Children are always at least one level deeper than their parent.
        let level = match stack.last() {
            Some((_, parent)) => HeadingLevel::from_depth(depth).max(parent.level.deeper()),
            None => HeadingLevel::from_depth(depth),
        };
        let node = OutlineNode::new(level, h.title).with_bullets(h.bullets);
        stack.push((depth, node));
    }
    while !stack.is_empty() {
        attach(&mut stack, &mut roots);
    }
    roots
}
