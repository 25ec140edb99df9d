//! Coherence Checker: post-hoc cross-section drift analysis.
//!
//! Stateless and side-effect free; one checker can serve every session.
//! Signals per adjacent section pair:
//! - topical drift: cosine similarity of content-word frequencies,
//! - stylistic drift: ratio of mean sentence lengths,
//!
//! plus negation contradictions between any two sections ("X is Y" in
//! one section, "X is not Y" in another).

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use scribe_store::models::{CoherenceReport, Section, SectionFlag, SectionState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::summary::extractive::split_sentences;

/// Checker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherenceConfig {
    /// Adjacent sections below this cosine similarity are flagged.
    pub min_adjacent_similarity: f64,
    /// Sections with fewer content words are too short to judge topically.
    pub min_terms: usize,
    /// Adjacent sections whose mean sentence lengths differ by more than
    /// this factor are flagged.
    pub max_style_ratio: f64,
    /// Turn flags into a hard gate: a flagged document fails the session.
    pub block_on_flags: bool,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            min_adjacent_similarity: 0.05,
            min_terms: 5,
            max_style_ratio: 3.0,
            block_on_flags: false,
        }
    }
}

/// Errors from the checker. Callers degrade these to "no report".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoherenceError {
    #[error("no completed sections to check")]
    NoSections,
}

/// One section as seen by the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedSection {
    pub ordinal: usize,
    pub title: String,
    pub text: String,
}

impl CheckedSection {
    /// Completed sections in ordinal order.
    pub fn from_sections(sections: &[Section]) -> Vec<Self> {
        let mut out: Vec<Self> = sections
            .iter()
            .filter(|s| s.state == SectionState::Completed)
            .map(|s| Self {
                ordinal: s.ordinal,
                title: s.title.clone(),
                text: s.text.clone(),
            })
            .collect();
        out.sort_by_key(|s| s.ordinal);
        out
    }
}

const STOPWORDS: &[&str] = &[
    "about", "above", "after", "again", "also", "because", "been", "before", "being", "below",
    "between", "both", "could", "does", "doing", "during", "each", "even", "every", "from",
    "further", "have", "having", "here", "into", "itself", "just", "like", "made", "make", "many",
    "more", "most", "much", "must", "only", "other", "over", "same", "should", "some", "such",
    "than", "that", "their", "them", "then", "there", "these", "they", "this", "those",
    "through", "under", "until", "very", "were", "what", "when", "where", "which", "while",
    "will", "with", "would", "your",
];

const NEGATIONS: &[&str] = &["not", "never"];

fn terms(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.chars().count() < 4 || !word.chars().all(char::is_alphabetic) {
            continue;
        }
        let lower = word.to_lowercase();
        if STOPWORDS.contains(&lower.as_str()) {
            continue;
        }
        *tf.entry(lower).or_insert(0.0) += 1.0;
    }
    tf
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(k, va)| b.get(k).map(|vb| va * vb))
        .sum();
    let na = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let nb = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn mean_sentence_words(text: &str) -> Option<f64> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return None;
    }
    let words: usize = sentences.iter().map(|s| s.split_whitespace().count()).sum();
    Some(words as f64 / sentences.len() as f64)
}

fn sentence_words(sentence: &str) -> Vec<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Per-section normalized sentences: (plain, negated-with-negation-removed).
fn claim_sets(text: &str) -> (HashSet<String>, HashSet<String>) {
    let mut plain = HashSet::new();
    let mut negated = HashSet::new();
    for sentence in split_sentences(text) {
        let words = sentence_words(&sentence);
        let has_negation = words.iter().any(|w| NEGATIONS.contains(&w.as_str()));
        if has_negation {
            let stripped: Vec<&str> = words
                .iter()
                .map(String::as_str)
                .filter(|w| !NEGATIONS.contains(w))
                .collect();
            negated.insert(stripped.join(" "));
        } else {
            plain.insert(words.join(" "));
        }
    }
    (plain, negated)
}

/// Lexical coherence checker.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoherenceChecker {
    config: CoherenceConfig,
}

impl CoherenceChecker {
    pub fn new(config: CoherenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    /// Score `sections` (in document order) and flag inconsistent pairs.
    pub fn check(
        &self,
        document_id: Uuid,
        sections: &[CheckedSection],
    ) -> Result<CoherenceReport, CoherenceError> {
        if sections.is_empty() {
            return Err(CoherenceError::NoSections);
        }

        let vectors: Vec<HashMap<String, f64>> = sections.iter().map(|s| terms(&s.text)).collect();
        let styles: Vec<Option<f64>> = sections.iter().map(|s| mean_sentence_words(&s.text)).collect();
        let mut flags = Vec::new();
        let mut pair_scores = Vec::new();

        for i in 1..sections.len() {
            let (a, b) = (&sections[i - 1], &sections[i]);

            let similarity = cosine(&vectors[i - 1], &vectors[i]);
            let judgeable =
                vectors[i - 1].len() >= self.config.min_terms && vectors[i].len() >= self.config.min_terms;
            if judgeable && similarity < self.config.min_adjacent_similarity {
                flags.push(SectionFlag {
                    section_a: a.ordinal,
                    section_b: b.ordinal,
                    reason: format!(
                        "topic drift: similarity {similarity:.2} between \"{}\" and \"{}\"",
                        a.title, b.title
                    ),
                });
            }

            let style = match (styles[i - 1], styles[i]) {
                (Some(x), Some(y)) if x > 0.0 && y > 0.0 => {
                    let ratio = x.max(y) / x.min(y);
                    if ratio > self.config.max_style_ratio {
                        flags.push(SectionFlag {
                            section_a: a.ordinal,
                            section_b: b.ordinal,
                            reason: format!(
                                "style drift: mean sentence length differs {ratio:.1}x"
                            ),
                        });
                    }
                    let span = (self.config.max_style_ratio - 1.0).max(f64::EPSILON);
                    ((ratio - 1.0) / span).clamp(0.0, 1.0)
                }
                _ => 0.0,
            };

            let topical = if judgeable { 1.0 - similarity } else { 0.0 };
            pair_scores.push(0.6 * topical + 0.4 * style);
        }

        let claims: Vec<(HashSet<String>, HashSet<String>)> =
            sections.iter().map(|s| claim_sets(&s.text)).collect();
        let mut contradictions = 0usize;
        for i in 0..sections.len() {
            for j in 0..sections.len() {
                if i == j {
                    continue;
                }
                // Negated claim in i, plain claim in j.
                if let Some(claim) = claims[i].1.iter().find(|c| claims[j].0.contains(*c)) {
                    let (first, second) = if i < j { (i, j) } else { (j, i) };
                    flags.push(SectionFlag {
                        section_a: sections[first].ordinal,
                        section_b: sections[second].ordinal,
                        reason: format!("contradiction: \"{claim}\" is both asserted and negated"),
                    });
                    contradictions += 1;
                }
            }
        }

        let base = if pair_scores.is_empty() {
            0.0
        } else {
            pair_scores.iter().sum::<f64>() / pair_scores.len() as f64
        };
        let score = (base + 0.25 * contradictions as f64).clamp(0.0, 1.0);

        flags.sort_by_key(|f| (f.section_a, f.section_b));
        Ok(CoherenceReport {
            id: Uuid::new_v4(),
            document_id,
            score,
            flags,
            sections_checked: sections.len(),
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(ordinal: usize, title: &str, text: &str) -> CheckedSection {
        CheckedSection {
            ordinal,
            title: title.to_string(),
            text: text.to_string(),
        }
    }

    fn checker() -> CoherenceChecker {
        CoherenceChecker::new(CoherenceConfig::default())
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(
            checker().check(Uuid::new_v4(), &[]).unwrap_err(),
            CoherenceError::NoSections
        );
    }

    #[test]
    fn single_section_scores_zero() {
        let report = checker()
            .check(Uuid::new_v4(), &[section(0, "Only", "Revenue grew steadily this quarter.")])
            .unwrap();
        assert_eq!(report.score, 0.0);
        assert!(report.flags.is_empty());
        assert_eq!(report.sections_checked, 1);
    }

    #[test]
    fn related_sections_are_not_flagged() {
        let sections = [
            section(0, "Intro", "The quarterly revenue report covers regional sales growth and customer retention."),
            section(1, "Body", "Regional sales growth was strongest in the north. Customer retention improved alongside revenue."),
            section(2, "Conclusion", "Revenue and customer retention both support continued regional sales investment."),
        ];
        let report = checker().check(Uuid::new_v4(), &sections).unwrap();
        assert!(report.flags.is_empty(), "{:?}", report.flags);
        assert!((0.0..=1.0).contains(&report.score));
    }

    #[test]
    fn unrelated_adjacent_sections_are_flagged() {
        let sections = [
            section(0, "Revenue", "Quarterly revenue growth exceeded forecasts across regional markets and product lines."),
            section(1, "Gardening", "Tomato seedlings prefer sunny windowsills, gentle watering, and rich compost soil."),
        ];
        let report = checker().check(Uuid::new_v4(), &sections).unwrap();
        assert_eq!(report.flags.len(), 1);
        assert!(report.flags[0].reason.starts_with("topic drift"));
        assert_eq!((report.flags[0].section_a, report.flags[0].section_b), (0, 1));
        assert!(report.score > 0.5);
    }

    #[test]
    fn style_drift_is_flagged() {
        let terse = "Sales rose sharply. Costs fell again. Margins widened fast. Staff grew too.";
        let verbose = "Sales rose considerably over the period under review, driven by a combination \
                       of favourable pricing, expanded distribution, and renewed marketing effort \
                       across every regional office that the company currently operates.";
        let report = checker()
            .check(Uuid::new_v4(), &[section(0, "A", terse), section(1, "B", verbose)])
            .unwrap();
        assert!(report.flags.iter().any(|f| f.reason.starts_with("style drift")));
    }

    #[test]
    fn negation_contradiction_is_flagged() {
        let sections = [
            section(0, "Intro", "The merger was approved by regulators in March."),
            section(1, "Body", "Regional teams prepared integration plans for the merger approval."),
            section(2, "Conclusion", "The merger was not approved by regulators in March."),
        ];
        let report = checker().check(Uuid::new_v4(), &sections).unwrap();
        let contradiction = report
            .flags
            .iter()
            .find(|f| f.reason.starts_with("contradiction"))
            .unwrap();
        assert_eq!((contradiction.section_a, contradiction.section_b), (0, 2));
        assert!(report.score >= 0.25);
    }

    #[test]
    fn check_is_idempotent() {
        let sections = [
            section(0, "A", "Revenue grew in the north region this year."),
            section(1, "B", "North region revenue growth continued into next year."),
        ];
        let c = checker();
        let first = c.check(Uuid::nil(), &sections).unwrap();
        let second = c.check(Uuid::nil(), &sections).unwrap();
        assert_eq!(first.score, second.score);
        assert_eq!(first.flags, second.flags);
        assert_ne!(first.id, second.id);
    }
}
