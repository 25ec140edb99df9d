//! Built-in outline templates.
//!
//! A template only shapes the planning prompt: a suggested heading
//! skeleton and a style hint. The model may deviate from it.

/// A built-in document template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub id: &'static str,
    pub description: &'static str,
    pub skeleton: &'static [&'static str],
    pub style: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        id: "report",
        description: "Structured report with findings and recommendations",
        skeleton: &[
            "Executive summary",
            "Background",
            "Findings",
            "Recommendations",
            "Conclusion",
        ],
        style: "Formal, precise, numbers where available.",
    },
    Template {
        id: "article",
        description: "Long-form article for a general audience",
        skeleton: &["Introduction", "Context", "Main discussion", "Implications", "Closing"],
        style: "Engaging and clear; explain jargon on first use.",
    },
    Template {
        id: "tutorial",
        description: "Step-by-step instructional guide",
        skeleton: &[
            "Overview",
            "Prerequisites",
            "Steps",
            "Troubleshooting",
            "Next steps",
        ],
        style: "Second person, imperative steps, one idea per step.",
    },
    Template {
        id: "essay",
        description: "Argumentative essay",
        skeleton: &["Thesis", "Argument", "Counterargument", "Rebuttal", "Conclusion"],
        style: "Argued in the first person plural; every claim supported.",
    },
];

/// Look up a built-in template by id.
pub fn find(id: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|t| t.id == id)
}

/// All built-in templates.
pub fn all() -> &'static [Template] {
    TEMPLATES
}
