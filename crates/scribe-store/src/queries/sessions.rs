use chrono::Utc;
use uuid::Uuid;

use crate::models::{DraftMode, FailureInfo, GenerationSession, GlobalSummary, Outline, SessionPhase};
use crate::store::{Store, StoreError};

/// Insert a new session together with its empty (version 0) summary.
pub async fn insert_session(store: &Store, session: GenerationSession) -> GenerationSession {
    let mut state = store.state().write().await;
    state
        .summaries
        .insert(session.id, vec![GlobalSummary::empty()]);
    state.sections.entry(session.id).or_default();
    state.sessions.insert(session.id, session.clone());
    session
}

pub async fn get_session(store: &Store, session_id: Uuid) -> Option<GenerationSession> {
    store.state().read().await.sessions.get(&session_id).cloned()
}

/// All sessions, oldest first.
pub async fn list_sessions(store: &Store) -> Vec<GenerationSession> {
    let state = store.state().read().await;
    let mut sessions: Vec<GenerationSession> = state.sessions.values().cloned().collect();
    sessions.sort_by_key(|s| s.created_at);
    sessions
}

/// The most recently created session for a document.
pub async fn latest_session_for_document(
    store: &Store,
    document_id: Uuid,
) -> Option<GenerationSession> {
    let state = store.state().read().await;
    state
        .sessions
        .values()
        .filter(|s| s.document_id == document_id)
        .max_by_key(|s| s.created_at)
        .cloned()
}

/// Move a session from `from` to `to`.
///
/// Returns `Ok(false)` without changing anything when the stored phase is
/// not `from` (optimistic lock failure). Edge validity is the caller's job.
pub async fn transition_phase(
    store: &Store,
    session_id: Uuid,
    from: SessionPhase,
    to: SessionPhase,
) -> Result<bool, StoreError> {
    let mut state = store.state().write().await;
    let session = state
        .sessions
        .get_mut(&session_id)
        .ok_or(StoreError::SessionNotFound(session_id))?;
    if session.phase != from {
        return Ok(false);
    }
    session.phase = to;
    session.updated_at = Utc::now();
    Ok(true)
}

/// Attach the accepted (or fallback) outline and drafting mode.
pub async fn set_outline(
    store: &Store,
    session_id: Uuid,
    outline: Outline,
    mode: DraftMode,
) -> Result<(), StoreError> {
    let mut state = store.state().write().await;
    let session = state
        .sessions
        .get_mut(&session_id)
        .ok_or(StoreError::SessionNotFound(session_id))?;
    session.outline_id = Some(outline.id);
    session.mode = Some(mode);
    session.updated_at = Utc::now();
    state.outlines.insert(outline.id, outline);
    Ok(())
}

pub async fn record_failure(
    store: &Store,
    session_id: Uuid,
    failure: FailureInfo,
) -> Result<(), StoreError> {
    let mut state = store.state().write().await;
    let session = state
        .sessions
        .get_mut(&session_id)
        .ok_or(StoreError::SessionNotFound(session_id))?;
    session.failure = Some(failure);
    session.updated_at = Utc::now();
    Ok(())
}
