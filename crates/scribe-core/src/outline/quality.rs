//! Structural quality gate for candidate outlines.

use std::collections::HashSet;
use std::fmt;

use scribe_store::models::Outline;

/// One reason a candidate outline was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityIssue {
    /// Only one section: the model ignored the structure request.
    SingleSection,
    /// Fewer sections than configured.
    TooShallow { sections: usize, required: usize },
    /// Leaf headings without enough bullets.
    EmptyBullets { titles: Vec<String> },
    /// The same heading appears more than once.
    DuplicateTitle(String),
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleSection => f.write_str("outline has a single section"),
            Self::TooShallow { sections, required } => {
                write!(f, "outline has {sections} sections, at least {required} required")
            }
            Self::EmptyBullets { titles } => {
                write!(f, "headings without bullets: {}", titles.join(", "))
            }
            Self::DuplicateTitle(title) => write!(f, "duplicate heading {title:?}"),
        }
    }
}

/// Structural thresholds an outline must meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityGate {
    pub min_sections: usize,
    /// Bullets required on every heading without children.
    pub min_bullets: usize,
}

impl QualityGate {
    /// Every issue found; empty means the outline is accepted.
    pub fn assess(&self, outline: &Outline) -> Vec<QualityIssue> {
        let sections = outline.sections();
        let mut issues = Vec::new();

        if sections.len() <= 1 {
            issues.push(QualityIssue::SingleSection);
        } else if sections.len() < self.min_sections {
            issues.push(QualityIssue::TooShallow {
                sections: sections.len(),
                required: self.min_sections,
            });
        }

        // Container headings may rely on their children for content.
        let bare: Vec<String> = sections
            .iter()
            .filter(|n| n.children.is_empty())
            .filter(|n| n.bullets.iter().filter(|b| !b.trim().is_empty()).count() < self.min_bullets)
            .map(|n| n.title.clone())
            .collect();
        if !bare.is_empty() {
            issues.push(QualityIssue::EmptyBullets { titles: bare });
        }

        let mut seen = HashSet::new();
        for node in &sections {
            if !seen.insert(node.title.to_lowercase()) {
                issues.push(QualityIssue::DuplicateTitle(node.title.clone()));
                break;
            }
        }

        issues
    }
}

/// Render issues as one line for logs and fallback reasons.
pub fn describe(issues: &[QualityIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_store::models::{HeadingLevel, OutlineNode};

    const GATE: QualityGate = QualityGate {
        min_sections: 3,
        min_bullets: 1,
    };

    fn node(title: &str, bullets: &[&str]) -> OutlineNode {
        OutlineNode::new(HeadingLevel::H2, title).with_bullets(bullets.iter().copied())
    }

    #[test]
    fn well_formed_outline_passes() {
        let outline = Outline::new(
            "Doc",
            None,
            vec![node("Intro", &["a"]), node("Body", &["b"]), node("End", &["c"])],
        );
        assert!(GATE.assess(&outline).is_empty());
    }

    #[test]
    fn single_section_is_degenerate() {
        let outline = Outline::new("Doc", None, vec![node("Everything", &["a", "b"])]);
        assert_eq!(GATE.assess(&outline), vec![QualityIssue::SingleSection]);
    }

    #[test]
    fn too_few_sections() {
        let outline = Outline::new("Doc", None, vec![node("A", &["a"]), node("B", &["b"])]);
        assert_eq!(
            GATE.assess(&outline),
            vec![QualityIssue::TooShallow {
                sections: 2,
                required: 3
            }]
        );
    }

    #[test]
    fn empty_leaf_bullets_flagged_but_containers_allowed() {
        let parent = OutlineNode::new(HeadingLevel::H2, "Body")
            .with_children(vec![OutlineNode::new(HeadingLevel::H3, "Detail").with_bullets(["x"])]);
        let outline = Outline::new(
            "Doc",
            None,
            vec![node("Intro", &["a"]), parent, node("End", &["  "])],
        );
        assert_eq!(
            GATE.assess(&outline),
            vec![QualityIssue::EmptyBullets {
                titles: vec!["End".to_string()]
            }]
        );
    }

    #[test]
    fn duplicate_titles_flagged() {
        let outline = Outline::new(
            "Doc",
            None,
            vec![node("Intro", &["a"]), node("intro", &["b"]), node("End", &["c"])],
        );
        let issues = GATE.assess(&outline);
        assert_eq!(issues, vec![QualityIssue::DuplicateTitle("intro".to_string())]);
        assert_eq!(describe(&issues), "duplicate heading \"intro\"");
    }
}
