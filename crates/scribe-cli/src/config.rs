//! Configuration file management for scribe.
//!
//! Provides a TOML-based config file at `~/.config/scribe/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.
//!
//! ```toml
//! [pipeline.budget]
//! ceiling = 8192
//!
//! [generator]
//! program = "claude"
//! args = ["-p"]
//! format = "text"
//!
//! [store]
//! snapshot_dir = "/home/me/.local/state/scribe"
//! retain_sessions = 50
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use scribe_core::capability::{
    CommandGenerator, KeywordRetriever, NoRetrieval, OutputFormat, Retriever,
};
use scribe_core::{Coordinator, PipelineConfig};
use scribe_store::Store;
use scribe_store::config::StoreConfig;

/// Overrides the budget ceiling.
pub const CEILING_ENV: &str = "SCRIBE_CONTEXT_CEILING";
/// Overrides the generator command line (`"claude -p"`).
pub const GENERATOR_CMD_ENV: &str = "SCRIBE_GENERATOR_CMD";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub store: StoreSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            format: OutputFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    /// Where session snapshots are written. Unset keeps sessions in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
    /// How many finished sessions to keep in memory. Unset keeps all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_sessions: Option<usize>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the scribe config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/scribe` or `~/.config/scribe`,
/// on macOS too.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("scribe");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("scribe")
}

/// Return the path to the scribe config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Flags that take precedence over everything else.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub ceiling: Option<u32>,
    pub generator_cmd: Option<String>,
    pub snapshot_dir: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ScribeConfig {
    pub pipeline: PipelineConfig,
    pub generator: CommandGenerator,
    pub store: StoreConfig,
}

impl ScribeConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Ceiling: `--ceiling` > `SCRIBE_CONTEXT_CEILING` > `[pipeline.budget] ceiling` > 8192
    /// - Generator: `--generator-cmd` > `SCRIBE_GENERATOR_CMD` > `[generator]` > `claude -p`
    /// - Snapshots: `--snapshot-dir` > `SCRIBE_SNAPSHOT_DIR` > `[store] snapshot_dir` > none
    ///
    /// A config file that exists but does not parse is an error; a missing
    /// one is not.
    pub fn resolve(overrides: &CliOverrides) -> Result<Self> {
        let file_config = if config_path().exists() {
            load_config()?
        } else {
            ConfigFile::default()
        };

        let mut pipeline = file_config.pipeline;
        if let Some(ceiling) = overrides.ceiling {
            pipeline.budget.ceiling = ceiling;
        } else if let Ok(raw) = std::env::var(CEILING_ENV) {
            pipeline.budget.ceiling = raw
                .trim()
                .parse()
                .with_context(|| format!("{CEILING_ENV} is not a token count: {raw:?}"))?;
        }
        pipeline
            .validate()
            .context("invalid pipeline configuration")?;

        let format = file_config.generator.format;
        let generator = if let Some(ref line) = overrides.generator_cmd {
            CommandGenerator::from_command_line(line, format)?
        } else if let Ok(line) = std::env::var(GENERATOR_CMD_ENV) {
            CommandGenerator::from_command_line(&line, format)
                .with_context(|| format!("invalid {GENERATOR_CMD_ENV}"))?
        } else {
            CommandGenerator::new(
                file_config.generator.program,
                file_config.generator.args,
                format,
            )
        };

        let mut store = if let Some(ref dir) = overrides.snapshot_dir {
            StoreConfig::with_snapshot_dir(dir)
        } else {
            let from_env = StoreConfig::from_env();
            if from_env.snapshot_dir.is_some() {
                from_env
            } else if let Some(dir) = file_config.store.snapshot_dir {
                StoreConfig::with_snapshot_dir(dir)
            } else {
                StoreConfig::in_memory()
            }
        };
        if let Some(count) = file_config.store.retain_sessions {
            store = store.with_retention(count);
        }

        Ok(Self {
            pipeline,
            generator,
            store,
        })
    }

    /// Assemble a coordinator, retrieving from the notes in `references`
    /// when given.
    pub fn coordinator(&self, references: Option<&Path>) -> Result<Coordinator> {
        let retriever: Arc<dyn Retriever> = match references {
            Some(dir) => Arc::new(KeywordRetriever::from_dir(dir)?),
            None => Arc::new(NoRetrieval),
        };
        let store = Store::open(self.store.clone()).context("failed to open session store")?;
        let coordinator = Coordinator::new(
            self.pipeline.clone(),
            Arc::new(self.generator.clone()),
            retriever,
            store,
        )?;
        tracing::debug!(generator = self.generator.program(), "pipeline assembled");
        Ok(coordinator)
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
