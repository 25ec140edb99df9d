mod check_cmd;
mod config;
mod generate_cmd;
mod plan_cmd;
mod serve_cmd;
mod status_cmd;
#[cfg(test)]
mod test_util;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use config::{CliOverrides, ConfigFile, ScribeConfig};

#[derive(Parser)]
#[command(
    name = "scribe",
    about = "Long-document generation under a fixed model context budget"
)]
struct Cli {
    /// Token ceiling for a single model call (overrides SCRIBE_CONTEXT_CEILING)
    #[arg(long, global = true)]
    ceiling: Option<u32>,

    /// Generator command line, e.g. "claude -p" (overrides SCRIBE_GENERATOR_CMD)
    #[arg(long, global = true)]
    generator_cmd: Option<String>,

    /// Directory for session snapshots (overrides SCRIBE_SNAPSHOT_DIR)
    #[arg(long, global = true)]
    snapshot_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a scribe config file with default settings
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Produce an outline for a prompt without drafting it
    Plan {
        /// Document prompt ("-" reads it from stdin)
        prompt: String,
        /// Built-in outline template (see `scribe templates`)
        #[arg(long)]
        template: Option<String>,
        /// Print the outline as JSON
        #[arg(long)]
        json: bool,
    },
    /// List built-in outline templates
    Templates,
    /// Generate a full document, streaming it to stdout
    Generate {
        /// Document prompt ("-" reads it from stdin)
        prompt: String,
        /// Built-in outline template (see `scribe templates`)
        #[arg(long)]
        template: Option<String>,
        /// Also write the finished document to this file
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Directory of .md/.txt notes used as retrieval context
        #[arg(long)]
        references: Option<PathBuf>,
    },
    /// Check a Markdown document for cross-section inconsistencies
    Check {
        /// Markdown file to check
        file: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show session progress (omit session_id to list all sessions)
    Status {
        /// Session ID to show status for
        session_id: Option<String>,
    },
    /// Serve the pipeline over HTTP with server-sent events
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 7878)]
        port: u16,
        /// Directory of .md/.txt notes used as retrieval context
        #[arg(long)]
        references: Option<PathBuf>,
    },
    /// Print shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    let written = config::save_config(&ConfigFile::default())?;
    println!("Config written to {}", written.display());
    Ok(())
}

/// The prompt argument, or stdin when it is `-`.
fn read_prompt(arg: &str) -> anyhow::Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut prompt = String::new();
    std::io::stdin()
        .read_to_string(&mut prompt)
        .context("failed to read prompt from stdin")?;
    Ok(prompt)
}

fn snapshot_dir(resolved: &ScribeConfig) -> anyhow::Result<&Path> {
    resolved.store.snapshot_dir.as_deref().context(
        "no snapshot directory configured; pass --snapshot-dir, set SCRIBE_SNAPSHOT_DIR \
         or add [store] snapshot_dir to the config file",
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = CliOverrides {
        ceiling: cli.ceiling,
        generator_cmd: cli.generator_cmd,
        snapshot_dir: cli.snapshot_dir,
    };

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Plan {
            prompt,
            template,
            json,
        } => {
            let resolved = ScribeConfig::resolve(&overrides)?;
            let coordinator = resolved.coordinator(None)?;
            let prompt = read_prompt(&prompt)?;
            plan_cmd::run_plan(&coordinator, &prompt, template.as_deref(), json).await?;
        }
        Commands::Templates => {
            plan_cmd::list_templates();
        }
        Commands::Generate {
            prompt,
            template,
            output,
            references,
        } => {
            let resolved = ScribeConfig::resolve(&overrides)?;
            let coordinator = resolved.coordinator(references.as_deref())?;
            let prompt = read_prompt(&prompt)?;
            generate_cmd::run_generate(
                &coordinator,
                &prompt,
                template.as_deref(),
                output.as_deref(),
            )
            .await?;
        }
        Commands::Check { file, json } => {
            let resolved = ScribeConfig::resolve(&overrides)?;
            check_cmd::run_check(&file, resolved.pipeline.coherence, json)?;
        }
        Commands::Status { session_id } => {
            let resolved = ScribeConfig::resolve(&overrides)?;
            status_cmd::run_status(snapshot_dir(&resolved)?, session_id.as_deref())?;
        }
        Commands::Serve {
            bind,
            port,
            references,
        } => {
            let resolved = ScribeConfig::resolve(&overrides)?;
            let coordinator = resolved.coordinator(references.as_deref())?;
            serve_cmd::run_serve(coordinator, &bind, port).await?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "scribe", &mut std::io::stdout());
        }
    }

    Ok(())
}
