use chrono::Utc;
use uuid::Uuid;

use crate::models::{Section, SectionState};
use crate::store::{Store, StoreError};

/// Replace the section list of a session (ordered by ordinal).
pub async fn insert_sections(
    store: &Store,
    session_id: Uuid,
    mut sections: Vec<Section>,
) -> Result<(), StoreError> {
    let mut state = store.state().write().await;
    if !state.sessions.contains_key(&session_id) {
        return Err(StoreError::SessionNotFound(session_id));
    }
    sections.sort_by_key(|s| s.ordinal);
    state.sections.insert(session_id, sections);
    Ok(())
}

pub async fn list_sections(store: &Store, session_id: Uuid) -> Vec<Section> {
    store
        .state()
        .read()
        .await
        .sections
        .get(&session_id)
        .cloned()
        .unwrap_or_default()
}

pub async fn get_section(store: &Store, session_id: Uuid, section_id: Uuid) -> Option<Section> {
    store
        .state()
        .read()
        .await
        .sections
        .get(&session_id)
        .and_then(|sections| sections.iter().find(|s| s.id == section_id).cloned())
}

/// Move a section from `from` to `to` with optimistic locking.
///
/// Entering `streaming` counts a new attempt. Entering `streaming` or
/// `queued` clears any partial text: a stream is never resumed.
pub async fn transition_section(
    store: &Store,
    session_id: Uuid,
    section_id: Uuid,
    from: SectionState,
    to: SectionState,
) -> Result<bool, StoreError> {
    let mut state = store.state().write().await;
    let section = find_mut(&mut state.sections, session_id, section_id)?;
    if section.state != from {
        return Ok(false);
    }
    section.state = to;
    if matches!(to, SectionState::Streaming | SectionState::Queued) {
        section.text.clear();
        section.tokens_used = 0;
    }
    if to == SectionState::Streaming {
        section.attempts += 1;
    }
    section.updated_at = Utc::now();
    Ok(true)
}

/// `streaming -> completed`, storing the final text.
pub async fn complete_section(
    store: &Store,
    session_id: Uuid,
    section_id: Uuid,
    text: String,
    tokens_used: u32,
) -> Result<bool, StoreError> {
    let mut state = store.state().write().await;
    let section = find_mut(&mut state.sections, session_id, section_id)?;
    if section.state != SectionState::Streaming {
        return Ok(false);
    }
    section.state = SectionState::Completed;
    section.text = text;
    section.tokens_used = tokens_used;
    section.updated_at = Utc::now();
    Ok(true)
}

fn find_mut(
    sections: &mut std::collections::HashMap<Uuid, Vec<Section>>,
    session_id: Uuid,
    section_id: Uuid,
) -> Result<&mut Section, StoreError> {
    sections
        .get_mut(&session_id)
        .ok_or(StoreError::SessionNotFound(session_id))?
        .iter_mut()
        .find(|s| s.id == section_id)
        .ok_or(StoreError::SectionNotFound {
            session_id,
            section_id,
        })
}
