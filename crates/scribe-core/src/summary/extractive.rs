//! Extractive summary compression.
//!
//! The prior summary and the new section are split into candidate
//! sentences, scored for information future sections are likely to need,
//! and re-selected from scratch under the cap. Every refresh re-compresses
//! the whole summary; nothing is appended blindly.
//!
//! Summary lines look like `- [Section title] sentence`, so the section a
//! fact came from survives later refreshes.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::tokens::{CHARS_PER_TOKEN, truncate_to_tokens};

use super::{RefreshError, SummaryRefresher};

/// Words that mark a stated constraint.
const CONSTRAINT_CUES: &[&str] = &[
    "must", "should", "never", "always", "require", "requires", "required", "only", "cannot",
    "will",
];

/// Words that mark an open thread a later section may pick up.
const OPEN_CUES: &[&str] = &[
    "next", "later", "remain", "remains", "open", "unresolved", "pending", "todo",
];

const MIN_SENTENCE_WORDS: usize = 3;

#[derive(Debug, Clone)]
struct Candidate {
    line: String,
    order: usize,
    is_new: bool,
    score: f64,
}

fn words_lower(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn normalize(text: &str) -> String {
    words_lower(text).join(" ")
}

/// Split prose into sentences, dropping Markdown markers and fragments.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line
            .trim()
            .trim_start_matches(|c: char| c == '#' || c == '>' || c == '-' || c == '*' || c == '+')
            .trim();
        if line.is_empty() {
            continue;
        }
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            let at_boundary = matches!(c, '.' | '!' | '?')
                && chars.peek().is_none_or(|next| next.is_whitespace());
            if at_boundary {
                push_sentence(&mut out, &current);
                current.clear();
            }
        }
        push_sentence(&mut out, &current);
    }
    out
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let sentence = raw.trim();
    if sentence.split_whitespace().count() >= MIN_SENTENCE_WORDS {
        out.push(sentence.to_string());
    }
}

fn score(sentence: &str, is_new: bool) -> f64 {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    let entities = words
        .iter()
        .skip(1)
        .filter(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .chars()
                .next()
                .is_some_and(char::is_uppercase)
        })
        .count();
    let numbers = words
        .iter()
        .filter(|w| w.chars().any(|c| c.is_ascii_digit()))
        .count();
    let lower = words_lower(sentence);
    let has = |cues: &[&str]| lower.iter().any(|w| cues.contains(&w.as_str()));

    let mut s = entities as f64 + numbers as f64;
    if has(CONSTRAINT_CUES) {
        s += 2.0;
    }
    if sentence.contains('?') || has(OPEN_CUES) {
        s += 2.0;
    }
    if is_new {
        s += 1.0;
    }
    // Prefer dense sentences.
    s - words.len() as f64 / 40.0
}

fn format_line(title: &str, sentence: &str) -> String {
    if title.is_empty() {
        format!("- {sentence}")
    } else {
        format!("- [{title}] {sentence}")
    }
}

/// Parse a prior summary back into (title, sentence) pairs.
fn prior_entries(prior: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for line in prior.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let body = line.strip_prefix("- ").unwrap_or(line);
        let tagged = body
            .strip_prefix('[')
            .and_then(|rest| rest.split_once("] "));
        match tagged {
            Some((title, sentence)) => entries.push((title.to_string(), sentence.trim().to_string())),
            None => entries.push((String::new(), body.to_string())),
        }
    }
    entries
}

fn estimate_chars(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Merge `prior` and a completed section into a summary of at most
/// `cap_tokens`.
pub fn compress(prior: &str, section_title: &str, section_text: &str, cap_tokens: u32) -> String {
    if cap_tokens == 0 {
        return String::new();
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut seen = HashSet::new();
    let prior_iter = prior_entries(prior).into_iter().map(|(t, s)| (t, s, false));
    let new_iter = split_sentences(section_text)
        .into_iter()
        .map(|s| (section_title.to_string(), s, true));
    for (title, sentence, is_new) in prior_iter.chain(new_iter) {
        if sentence.is_empty() || !seen.insert(normalize(&sentence)) {
            continue;
        }
        candidates.push(Candidate {
            score: score(&sentence, is_new),
            line: format_line(&title, &sentence),
            order: candidates.len(),
            is_new,
        });
    }
    if candidates.is_empty() {
        return truncate_to_tokens(prior, cap_tokens);
    }

    let mut selected: Vec<(usize, String)> = Vec::new();
    let mut used_chars = 0usize;
    let mut try_add = |selected: &mut Vec<(usize, String)>, order: usize, line: &str| -> bool {
        let sep = usize::from(!selected.is_empty());
        let next = used_chars + sep + line.chars().count();
        if estimate_chars(next) <= cap_tokens {
            used_chars = next;
            selected.push((order, line.to_string()));
            true
        } else {
            false
        }
    };

    // The new section is always represented, shortened if it must be.
    let best_new = candidates
        .iter()
        .filter(|c| c.is_new)
        .max_by(|a, b| a.score.total_cmp(&b.score).then(b.order.cmp(&a.order)));
    let mut reserved = None;
    if let Some(best) = best_new {
        if !try_add(&mut selected, best.order, &best.line) {
            let short = truncate_to_tokens(&best.line, cap_tokens / 2);
            if !short.is_empty() && try_add(&mut selected, best.order, &short) {
                reserved = Some(best.order);
            }
        } else {
            reserved = Some(best.order);
        }
    }

    let mut ranked: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| Some(c.order) != reserved)
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.order.cmp(&b.order)));
    for c in ranked {
        try_add(&mut selected, c.order, &c.line);
    }

    if selected.is_empty() {
        let best = candidates
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .map(|c| c.line.as_str())
            .unwrap_or_default();
        return truncate_to_tokens(best, cap_tokens);
    }

    selected.sort_by_key(|(order, _)| *order);
    selected
        .into_iter()
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Local, deterministic refresher. The default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveRefresher;

#[async_trait]
impl SummaryRefresher for ExtractiveRefresher {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn refresh(
        &self,
        prior: &str,
        section_title: &str,
        section_text: &str,
        cap_tokens: u32,
    ) -> Result<String, RefreshError> {
        Ok(compress(prior, section_title, section_text, cap_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::estimate_tokens;

    #[test]
    fn splits_sentences_and_drops_fragments() {
        let s = split_sentences(
            "## Heading\n- Alice met Bob in 2019. Ok. Is it done? Version 1.5 shipped late.",
        );
        assert_eq!(
            s,
            vec![
                "Alice met Bob in 2019.",
                "Is it done?",
                "Version 1.5 shipped late."
            ]
        );
    }

    #[test]
    fn prior_lines_keep_their_titles() {
        let entries = prior_entries("- [Intro] Scope is Q3 2024.\nloose line here");
        assert_eq!(entries[0], ("Intro".to_string(), "Scope is Q3 2024.".to_string()));
        assert_eq!(entries[1], (String::new(), "loose line here".to_string()));
    }

    #[test]
    fn prefers_entities_numbers_and_constraints() {
        let text = "It was a nice day overall. The Vienna office must cut costs by 12% before March. \
                    Things were generally fine and people were pleased.";
        let out = compress("", "Body", text, 20);
        assert!(out.contains("Vienna office must cut costs"), "{out}");
        assert!(!out.contains("nice day"));
        assert!(estimate_tokens(&out) <= 20);
    }

    #[test]
    fn new_section_is_always_represented() {
        let prior = (0..30)
            .map(|i| format!("- [Old] Fact number {i} about Acme Corp in 20{i:02}."))
            .collect::<Vec<_>>()
            .join("\n");
        let out = compress(&prior, "Conclusion", "We recommend a staged rollout next year.", 60);
        assert!(out.contains("[Conclusion]"), "{out}");
        assert!(estimate_tokens(&out) <= 60);
    }

    #[test]
    fn output_preserves_document_order() {
        let out = compress(
            "- [Intro] Alice founded Acme in 2001.",
            "Body",
            "Bob joined Acme in 2005.",
            200,
        );
        assert_eq!(
            out,
            "- [Intro] Alice founded Acme in 2001.\n- [Body] Bob joined Acme in 2005."
        );
    }

    #[test]
    fn duplicates_are_collapsed() {
        let out = compress("- [Intro] Alice founded Acme in 2001.", "Body", "Alice founded Acme in 2001.", 200);
        assert_eq!(out.lines().count(), 1);
    }

    #[test]
    fn zero_cap_is_empty() {
        assert_eq!(compress("- [A] something here", "B", "More text here now.", 0), "");
    }

    #[test]
    fn oversized_single_sentence_is_truncated() {
        let long = format!("{} end.", "word ".repeat(200));
        let out = compress("", "Only", &long, 10);
        assert!(!out.is_empty());
        assert!(estimate_tokens(&out) <= 10);
    }

    #[test]
    fn repeated_refresh_stays_bounded() {
        let cap = 120;
        let mut summary = String::new();
        for i in 0..60 {
            let section = format!(
                "Section {i} introduces Project Falcon phase {i}. The team must ship by week {i}. \
                 Open question {i}: who owns the Berlin rollout? Budget is {i}00 dollars."
            );
            summary = compress(&summary, &format!("Part {i}"), &section, cap);
            assert!(estimate_tokens(&summary) <= cap, "refresh {i} exceeded cap");
            assert!(summary.contains(&format!("[Part {i}]")));
        }
    }
}
