//! In-memory session store with optional JSON snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::models::{
    CoherenceReport, GenerationSession, GlobalSummary, Outline, Section, SessionSnapshot,
};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("section {section_id} not found in session {session_id}")]
    SectionNotFound { session_id: Uuid, section_id: Uuid },

    #[error("failed to access snapshot at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed snapshot at {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) sessions: HashMap<Uuid, GenerationSession>,
    pub(crate) outlines: HashMap<Uuid, Outline>,
    /// Keyed by session id, ordered by ordinal.
    pub(crate) sections: HashMap<Uuid, Vec<Section>>,
    /// Keyed by session id; the last entry is the current version.
    pub(crate) summaries: HashMap<Uuid, Vec<GlobalSummary>>,
    /// Keyed by document id, oldest first.
    pub(crate) reports: HashMap<Uuid, Vec<CoherenceReport>>,
}

impl StoreState {
    pub(crate) fn snapshot(&self, session_id: Uuid) -> Result<SessionSnapshot, StoreError> {
        let session = self
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(session_id))?;
        let outline = session
            .outline_id
            .and_then(|id| self.outlines.get(&id).cloned());
        let sections = self.sections.get(&session_id).cloned().unwrap_or_default();
        let summaries = self.summaries.get(&session_id).cloned().unwrap_or_default();
        let reports = self
            .reports
            .get(&session.document_id)
            .cloned()
            .unwrap_or_default();
        Ok(SessionSnapshot {
            session,
            outline,
            sections,
            summaries,
            reports,
        })
    }

    /// Drop a session and everything it owns. Reports go once no session
    /// of their document is left.
    fn evict(&mut self, session_id: Uuid) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        if let Some(outline_id) = session.outline_id {
            self.outlines.remove(&outline_id);
        }
        self.sections.remove(&session_id);
        self.summaries.remove(&session_id);
        let document_in_use = self
            .sessions
            .values()
            .any(|s| s.document_id == session.document_id);
        if !document_in_use {
            self.reports.remove(&session.document_id);
        }
    }
}

/// Shared handle to the session store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    state: Arc<RwLock<StoreState>>,
    config: StoreConfig,
}

impl Store {
    /// Open a store, creating the snapshot directory if one is configured.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(dir) = &config.snapshot_dir {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            tracing::debug!(dir = %dir.display(), "session snapshots enabled");
        }
        Ok(Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            config,
        })
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            config: StoreConfig::in_memory(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> &RwLock<StoreState> {
        &self.state
    }

    /// Everything known about one session.
    pub async fn snapshot(&self, session_id: Uuid) -> Result<SessionSnapshot, StoreError> {
        self.state.read().await.snapshot(session_id)
    }

    /// Evict the oldest finished sessions beyond the configured retention.
    /// Returns how many were evicted.
    pub async fn prune_finished(&self) -> usize {
        let Some(retain) = self.config.retain_finished else {
            return 0;
        };
        let mut state = self.state.write().await;
        let mut finished: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.phase.is_terminal())
            .map(|s| (s.updated_at, s.id))
            .collect();
        if finished.len() <= retain {
            return 0;
        }
        finished.sort();
        let evicted = finished.len() - retain;
        for (_, session_id) in finished.into_iter().take(evicted) {
            state.evict(session_id);
            tracing::debug!(session_id = %session_id, "finished session evicted");
        }
        evicted
    }

    /// Write the session's snapshot file.
    ///
    /// Returns `Ok(false)` when snapshots are disabled. The file is written
    /// to a temporary path and renamed so readers never see a partial file.
    pub async fn flush_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let Some(path) = self.config.snapshot_path(session_id) else {
            return Ok(false);
        };
        let snapshot = self.snapshot(session_id).await?;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(true)
    }

    /// Read every session snapshot in a directory, oldest session first.
    pub fn load_snapshots(dir: &Path) -> Result<Vec<SessionSnapshot>, StoreError> {
        let entries = std::fs::read_dir(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let snapshot: SessionSnapshot = serde_json::from_slice(&bytes)
                .map_err(|source| StoreError::Decode { path, source })?;
            snapshots.push(snapshot);
        }
        snapshots.sort_by_key(|s| s.session.created_at);
        Ok(snapshots)
    }
}
