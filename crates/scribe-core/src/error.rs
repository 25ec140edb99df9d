//! Pipeline-level error taxonomy.

use scribe_store::models::SessionPhase;

use crate::budget::BudgetRejection;
use crate::section::SectionError;

/// Why a session stopped short of `completed`.
///
/// Budget and planning problems are normally resolved locally (trimming,
/// fallback) and only appear here when the local recovery itself failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// The outline was rejected and the single-shot fallback failed too.
    #[error("planning failed: {0}")]
    PlanningFailure(String),

    /// Even an empty context does not fit the ceiling.
    #[error("budget exceeded for section {ordinal}: {rejection}")]
    BudgetExceeded {
        ordinal: usize,
        rejection: BudgetRejection,
    },

    /// A section failed twice.
    #[error("generation failed for section {ordinal} after {attempts} attempts: {source}")]
    GenerationFailure {
        ordinal: usize,
        attempts: u32,
        #[source]
        source: SectionError,
    },

    /// The session was aborted and released before anyone resumed it.
    /// Not an error from the user's point of view.
    #[error("session aborted")]
    SessionAborted,

    /// An invariant was violated or the store refused a transition.
    #[error("irrecoverable failure during {phase}: {reason}")]
    IrrecoverableFailure { phase: SessionPhase, reason: String },
}

impl PipelineError {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::SessionAborted)
    }

    pub(crate) fn irrecoverable(phase: SessionPhase, err: impl std::fmt::Display) -> Self {
        Self::IrrecoverableFailure {
            phase,
            reason: err.to_string(),
        }
    }
}
