//! Events a running session reports to its caller.

use scribe_store::models::{CoherenceReport, Outline, SessionPhase};
use serde::{Deserialize, Serialize};

use crate::budget::TrimStep;
use crate::section::TextIncrement;

/// Progress of one session, in the order it happened.
///
/// Delivered through a bounded queue: a full queue makes the session wait
/// rather than drop events. Once the receiver is gone, events are
/// discarded and the session carries on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged {
        from: SessionPhase,
        to: SessionPhase,
    },
    OutlineReady {
        outline: Outline,
    },
    /// The outline was rejected; the document is drafted in one call.
    Fallback {
        reason: String,
    },
    /// An admitted call reached the warning threshold.
    BudgetWarning {
        ordinal: usize,
        total: u64,
        ceiling: u32,
    },
    ContextTrimmed {
        ordinal: usize,
        steps: Vec<TrimStep>,
    },
    SectionStarted {
        ordinal: usize,
        attempt: u32,
    },
    Increment(TextIncrement),
    SectionCompleted {
        ordinal: usize,
        tokens: u32,
    },
    SectionFailed {
        ordinal: usize,
        error: String,
        will_retry: bool,
    },
    SummaryRefreshed {
        version: u64,
        tokens: u32,
        through_ordinal: usize,
    },
    Report(CoherenceReport),
    ReportUnavailable {
        reason: String,
    },
    /// Always the last event of a session.
    Finished {
        phase: SessionPhase,
    },
}

impl SessionEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}
