use chrono::Utc;
use uuid::Uuid;

use crate::models::GlobalSummary;
use crate::store::{Store, StoreError};

/// The summary version currently in force.
pub async fn current_summary(store: &Store, session_id: Uuid) -> Option<GlobalSummary> {
    store
        .state()
        .read()
        .await
        .summaries
        .get(&session_id)
        .and_then(|history| history.last().cloned())
}

/// Every version ever in force, oldest first.
pub async fn summary_history(store: &Store, session_id: Uuid) -> Vec<GlobalSummary> {
    store
        .state()
        .read()
        .await
        .summaries
        .get(&session_id)
        .cloned()
        .unwrap_or_default()
}

/// Make `next` the current summary.
///
/// Succeeds only when `next.version` directly follows the current version;
/// otherwise returns `Ok(false)` and leaves the lineage untouched. The
/// swap happens under one write lock, so readers see either the old or
/// the new version, never both or neither.
pub async fn supersede_summary(
    store: &Store,
    session_id: Uuid,
    next: GlobalSummary,
) -> Result<bool, StoreError> {
    let mut state = store.state().write().await;
    let current_version = state
        .summaries
        .get(&session_id)
        .and_then(|history| history.last())
        .map(|s| s.version)
        .ok_or(StoreError::SessionNotFound(session_id))?;
    if next.version != current_version + 1 {
        return Ok(false);
    }

    let version = next.version;
    if let Some(history) = state.summaries.get_mut(&session_id) {
        history.push(next);
    }
    if let Some(session) = state.sessions.get_mut(&session_id) {
        session.summary_version = version;
        session.updated_at = Utc::now();
    }
    Ok(true)
}
