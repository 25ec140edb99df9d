use std::env;
use std::path::PathBuf;

/// Store configuration.
///
/// Reads the snapshot directory from `SCRIBE_SNAPSHOT_DIR`. Without one the
/// store is purely in-memory.
///
/// By default every session stays in memory for the life of the process.
/// Set `retain_finished` to keep only that many completed or failed
/// sessions; older ones are evicted (their snapshot files stay on disk).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory receiving one JSON snapshot per session.
    pub snapshot_dir: Option<PathBuf>,
    /// How many finished sessions to keep in memory. `None` keeps all.
    pub retain_finished: Option<usize>,
}

impl StoreConfig {
    /// Environment variable naming the snapshot directory.
    pub const SNAPSHOT_DIR_ENV: &str = "SCRIBE_SNAPSHOT_DIR";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let snapshot_dir = env::var(Self::SNAPSHOT_DIR_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        Self {
            snapshot_dir,
            retain_finished: None,
        }
    }

    /// Build a config with an explicit snapshot directory.
    pub fn with_snapshot_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: Some(dir.into()),
            retain_finished: None,
        }
    }

    /// In-memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Keep at most `count` finished sessions in memory.
    pub fn with_retention(mut self, count: usize) -> Self {
        self.retain_finished = Some(count);
        self
    }

    /// Path of the snapshot file for a session, if snapshots are enabled.
    pub fn snapshot_path(&self, session_id: uuid::Uuid) -> Option<PathBuf> {
        self.snapshot_dir
            .as_ref()
            .map(|dir| dir.join(format!("{session_id}.json")))
    }
}
