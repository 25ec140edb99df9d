//! Session and section state machines.
//!
//! Validates transitions against the allowed graphs and executes them
//! against the store with optimistic locking: a transition only applies
//! when the stored state still equals `from`.

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use scribe_store::Store;
use scribe_store::models::{SectionState, SessionPhase};
use scribe_store::queries::{sections as section_db, sessions as session_db};

/// The session state machine.
///
/// ```text
/// planning -> drafting | failed
/// drafting -> revising | paused | failed
/// revising -> completed | paused | failed
/// paused   -> drafting | revising | failed
/// ```
pub struct SessionStateMachine;

impl SessionStateMachine {
    pub fn is_valid_transition(from: SessionPhase, to: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (from, to),
            (Planning, Drafting | Failed)
                | (Drafting, Revising | Paused | Failed)
                | (Revising, Completed | Paused | Failed)
                | (Paused, Drafting | Revising | Failed)
        )
    }

    /// Execute a phase transition.
    ///
    /// Returns an error if the edge is invalid, the session does not exist,
    /// or its phase is no longer `from`.
    pub async fn transition(
        store: &Store,
        session_id: Uuid,
        from: SessionPhase,
        to: SessionPhase,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid phase transition: {from} -> {to} for session {session_id}");
        }

        let moved = session_db::transition_phase(store, session_id, from, to)
            .await
            .with_context(|| format!("failed to move session {session_id} from {from} to {to}"))?;

        if !moved {
            let current = session_db::get_session(store, session_id)
                .await
                .map(|s| s.phase.to_string())
                .unwrap_or_else(|| "missing".to_string());
            bail!(
                "optimistic lock failed: session {session_id} is {current}, expected {from}"
            );
        }

        tracing::debug!(session_id = %session_id, %from, %to, "session phase changed");
        Ok(())
    }
}

/// The section state machine.
///
/// ```text
/// queued    -> streaming
/// streaming -> completed | failed | queued  (queued: partial text discarded)
/// failed    -> streaming                    (retry)
/// ```
pub struct SectionStateMachine;

impl SectionStateMachine {
    pub fn is_valid_transition(from: SectionState, to: SectionState) -> bool {
        use SectionState::*;
        matches!(
            (from, to),
            (Queued, Streaming)
                | (Streaming, Completed | Failed | Queued)
                | (Failed, Streaming)
        )
    }

    /// Execute a section transition. Completion goes through
    /// [`Self::complete`] because it also stores the text.
    pub async fn transition(
        store: &Store,
        session_id: Uuid,
        section_id: Uuid,
        from: SectionState,
        to: SectionState,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) || to == SectionState::Completed {
            bail!("invalid section transition: {from} -> {to} for section {section_id}");
        }

        let moved = section_db::transition_section(store, session_id, section_id, from, to)
            .await
            .with_context(|| format!("failed to move section {section_id} from {from} to {to}"))?;
        if !moved {
            bail!("optimistic lock failed: section {section_id} is not {from}");
        }
        Ok(())
    }

    /// `streaming -> completed`, storing the final text.
    pub async fn complete(
        store: &Store,
        session_id: Uuid,
        section_id: Uuid,
        text: String,
        tokens_used: u32,
    ) -> Result<()> {
        let moved = section_db::complete_section(store, session_id, section_id, text, tokens_used)
            .await
            .with_context(|| format!("failed to complete section {section_id}"))?;
        if !moved {
            bail!("optimistic lock failed: section {section_id} is not streaming");
        }
        Ok(())
    }
}
