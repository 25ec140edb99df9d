use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Phase of a generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Planning,
    Drafting,
    Revising,
    Paused,
    Completed,
    Failed,
}

impl SessionPhase {
    /// Whether no further transitions are possible from this phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Drafting => "drafting",
            Self::Revising => "revising",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionPhase {
    type Err = SessionPhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "drafting" => Ok(Self::Drafting),
            "revising" => Ok(Self::Revising),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SessionPhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionPhase`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid session phase: {0:?}")]
pub struct SessionPhaseParseError(pub String);

// ---------------------------------------------------------------------------

/// Lifecycle state of one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionState {
    Queued,
    Streaming,
    Completed,
    Failed,
}

impl fmt::Display for SectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for SectionState {
    type Err = SectionStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SectionStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SectionState`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid section state: {0:?}")]
pub struct SectionStateParseError(pub String);

// ---------------------------------------------------------------------------

/// How the document body is being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftMode {
    /// One streamed call per outline section.
    Sectioned,
    /// One single-shot draft of the whole document (outline rejected).
    Fallback,
}

impl fmt::Display for DraftMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sectioned => f.write_str("sectioned"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

// ---------------------------------------------------------------------------

/// Heading depth of an outline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingLevel {
    H1,
    H2,
    H3,
}

impl HeadingLevel {
    /// Numeric depth (1-3).
    pub fn depth(self) -> usize {
        match self {
            Self::H1 => 1,
            Self::H2 => 2,
            Self::H3 => 3,
        }
    }

    /// Map a Markdown `#` count to a level; anything deeper than 3 clamps to H3.
    pub fn from_depth(depth: usize) -> Self {
        match depth {
            0 | 1 => Self::H1,
            2 => Self::H2,
            _ => Self::H3,
        }
    }

    /// One level deeper, saturating at H3.
    pub fn deeper(self) -> Self {
        Self::from_depth(self.depth() + 1)
    }

    pub fn marker(self) -> &'static str {
        match self {
            Self::H1 => "#",
            Self::H2 => "##",
            Self::H3 => "###",
        }
    }
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// One heading of an outline with the content it is meant to cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub id: Uuid,
    pub level: HeadingLevel,
    pub title: String,
    /// Short statements of intended content.
    pub bullets: Vec<String>,
    pub children: Vec<OutlineNode>,
}

impl OutlineNode {
    pub fn new(level: HeadingLevel, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            title: title.into(),
            bullets: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style helper for attaching bullets.
    pub fn with_bullets<I, S>(mut self, bullets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bullets = bullets.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style helper for attaching children.
    pub fn with_children(mut self, children: Vec<OutlineNode>) -> Self {
        self.children = children;
        self
    }

    fn collect_preorder<'a>(&'a self, out: &mut Vec<&'a OutlineNode>) {
        out.push(self);
        for child in &self.children {
            child.collect_preorder(out);
        }
    }
}

/// Ordered heading tree produced by the planner.
///
/// Outlines are immutable once accepted. [`Outline::revised`] produces a
/// new outline (with a new id) instead of mutating an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub id: Uuid,
    pub title: String,
    pub template_id: Option<String>,
    pub nodes: Vec<OutlineNode>,
    pub created_at: DateTime<Utc>,
}

impl Outline {
    pub fn new(title: impl Into<String>, template_id: Option<String>, nodes: Vec<OutlineNode>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            template_id,
            nodes,
            created_at: Utc::now(),
        }
    }

    /// A one-node outline covering the whole document.
    pub fn single(title: impl Into<String>, template_id: Option<String>) -> Self {
        let title = title.into();
        let node = OutlineNode::new(HeadingLevel::H1, title.clone());
        Self::new(title, template_id, vec![node])
    }

    /// Every node in document (pre-)order. Each entry becomes one section.
    pub fn sections(&self) -> Vec<&OutlineNode> {
        let mut out = Vec::new();
        for node in &self.nodes {
            node.collect_preorder(&mut out);
        }
        out
    }

    pub fn section_count(&self) -> usize {
        self.sections().len()
    }

    /// Look up a node anywhere in the tree.
    pub fn node(&self, id: Uuid) -> Option<&OutlineNode> {
        self.sections().into_iter().find(|n| n.id == id)
    }

    /// Create a new outline with replacement nodes, keeping title and template.
    pub fn revised(&self, nodes: Vec<OutlineNode>) -> Outline {
        Outline::new(self.title.clone(), self.template_id.clone(), nodes)
    }

    /// Render as Markdown headings with bullet lists.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        if !self.title.is_empty() {
            out.push_str("# ");
            out.push_str(&self.title);
            out.push_str("\n\n");
        }
        for node in self.sections() {
            out.push_str(node.level.marker());
            out.push(' ');
            out.push_str(&node.title);
            out.push('\n');
            for bullet in &node.bullets {
                out.push_str("- ");
                out.push_str(bullet);
                out.push('\n');
            }
            out.push('\n');
        }
        out.truncate(out.trim_end().len());
        out.push('\n');
        out
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// One outline node paired with its generation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: Uuid,
    pub node_id: Uuid,
    pub ordinal: usize,
    pub level: HeadingLevel,
    pub title: String,
    pub state: SectionState,
    /// Accumulated text. Only set once the section completes.
    pub text: String,
    /// Estimated tokens consumed (prompt, context and output) by the
    /// attempt that completed the section.
    pub tokens_used: u32,
    /// Number of streaming attempts started.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl Section {
    pub fn queued(node: &OutlineNode, ordinal: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node.id,
            ordinal,
            level: node.level,
            title: node.title.clone(),
            state: SectionState::Queued,
            text: String::new(),
            tokens_used: 0,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Global summary
// ---------------------------------------------------------------------------

/// Bounded rolling condensation of every completed section of a session.
///
/// Versions are superseded, never edited: [`GlobalSummary::successor`]
/// produces the next version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub version: u64,
    pub text: String,
    pub token_count: u32,
    /// Ordinal of the last section folded into this summary.
    pub through_ordinal: Option<usize>,
    /// Hex SHA-256 of `text`.
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

impl GlobalSummary {
    /// Version zero: nothing written yet.
    pub fn empty() -> Self {
        Self {
            version: 0,
            text: String::new(),
            token_count: 0,
            through_ordinal: None,
            digest: content_digest(""),
            created_at: Utc::now(),
        }
    }

    /// The next version of this summary.
    pub fn successor(&self, text: String, token_count: u32, through_ordinal: usize) -> Self {
        let digest = content_digest(&text);
        Self {
            version: self.version + 1,
            text,
            token_count,
            through_ordinal: Some(through_ordinal),
            digest,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Hex-encoded SHA-256 of a string.
pub fn content_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

// ---------------------------------------------------------------------------
// Coherence
// ---------------------------------------------------------------------------

/// A pair of sections the coherence checker considers inconsistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionFlag {
    pub section_a: usize,
    pub section_b: usize,
    pub reason: String,
}

/// Post-hoc cross-section consistency assessment. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceReport {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Incoherence estimate in `[0, 1]`; 0 means no drift detected.
    pub score: f64,
    pub flags: Vec<SectionFlag>,
    pub sections_checked: usize,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Where and why a session failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub phase: SessionPhase,
    pub reason: String,
}

/// One document generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: Uuid,
    pub document_id: Uuid,
    pub prompt: String,
    pub template_id: Option<String>,
    pub phase: SessionPhase,
    pub mode: Option<DraftMode>,
    pub outline_id: Option<Uuid>,
    pub summary_version: u64,
    pub failure: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationSession {
    pub fn new(document_id: Uuid, prompt: impl Into<String>, template_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id,
            prompt: prompt.into(),
            template_id,
            phase: SessionPhase::Planning,
            mode: None,
            outline_id: None,
            summary_version: 0,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Everything the store knows about one session, as written to snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: GenerationSession,
    pub outline: Option<Outline>,
    pub sections: Vec<Section>,
    pub summaries: Vec<GlobalSummary>,
    pub reports: Vec<CoherenceReport>,
}

impl SessionSnapshot {
    /// The summary version currently in force.
    pub fn current_summary(&self) -> Option<&GlobalSummary> {
        self.summaries.last()
    }

    /// Completed section text in ordinal order, rendered as Markdown.
    pub fn document_text(&self) -> String {
        render_document(&self.sections)
    }
}

/// Render completed sections as a Markdown document.
pub fn render_document(sections: &[Section]) -> String {
    let mut ordered: Vec<&Section> = sections
        .iter()
        .filter(|s| s.state == SectionState::Completed)
        .collect();
    ordered.sort_by_key(|s| s.ordinal);

    let mut out = String::new();
    for section in ordered {
        out.push_str(section.level.marker());
        out.push(' ');
        out.push_str(&section.title);
        out.push_str("\n\n");
        out.push_str(section.text.trim());
        out.push_str("\n\n");
    }
    out.truncate(out.trim_end().len());
    out
}
