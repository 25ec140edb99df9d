//! `scribe status` command: show session progress from snapshots on disk.

use std::path::Path;

use anyhow::{Context, Result};
use uuid::Uuid;

use scribe_store::Store;
use scribe_store::models::{SectionState, SessionSnapshot};

/// Run the status command.
///
/// When `session_id_str` is `Some`, shows detailed status for that session.
/// When `None`, lists every session with a progress summary.
pub fn run_status(snapshot_dir: &Path, session_id_str: Option<&str>) -> Result<()> {
    let snapshots = if snapshot_dir.exists() {
        Store::load_snapshots(snapshot_dir)
            .with_context(|| format!("failed to read snapshots in {}", snapshot_dir.display()))?
    } else {
        Vec::new()
    };

    match session_id_str {
        Some(id_str) => {
            let session_id = Uuid::parse_str(id_str)
                .with_context(|| format!("invalid session ID: {id_str}"))?;
            let snapshot = snapshots
                .iter()
                .find(|s| s.session.id == session_id)
                .with_context(|| format!("session {session_id} not found"))?;
            print_session(snapshot);
            Ok(())
        }
        None => {
            print_sessions(&snapshots);
            Ok(())
        }
    }
}

fn progress(snapshot: &SessionSnapshot) -> String {
    let done = snapshot
        .sections
        .iter()
        .filter(|s| s.state == SectionState::Completed)
        .count();
    format!("{done}/{}", snapshot.sections.len())
}

/// Show detailed status for a single session.
fn print_session(snapshot: &SessionSnapshot) {
    let session = &snapshot.session;
    println!("Session: {}", session.id);
    println!("Document: {}", session.document_id);
    println!("Phase: {}", session.phase);
    if let Some(mode) = session.mode {
        println!("Mode: {mode}");
    }
    if let Some(template) = &session.template_id {
        println!("Template: {template}");
    }
    println!(
        "Updated: {}",
        session.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(failure) = &session.failure {
        println!("Failed during {}: {}", failure.phase, failure.reason);
    }
    println!();

    if let Some(outline) = &snapshot.outline {
        println!("Outline: {}", outline.title);
    }
    println!("Progress: {} sections completed", progress(snapshot));
    for section in &snapshot.sections {
        let icon = match section.state {
            SectionState::Queued => ".",
            SectionState::Streaming => "*",
            SectionState::Completed => "+",
            SectionState::Failed => "!",
        };
        println!(
            "  [{icon}] {} {} (attempts {}, {})",
            section.level.marker(),
            section.title,
            section.attempts,
            section.state
        );
    }

    if let Some(summary) = snapshot.current_summary() {
        println!();
        println!(
            "Summary: v{} ({} tokens, digest {})",
            summary.version,
            summary.token_count,
            &summary.digest[..summary.digest.len().min(12)]
        );
    }
    if let Some(report) = snapshot.reports.last() {
        println!(
            "Coherence: score {:.2}, {} flag(s)",
            report.score,
            report.flags.len()
        );
    }
}

/// List every session with a progress summary.
fn print_sessions(snapshots: &[SessionSnapshot]) {
    if snapshots.is_empty() {
        println!("No sessions found.");
        return;
    }

    println!(
        "{:<38} {:<11} {:>8}  {}",
        "ID", "PHASE", "PROGRESS", "PROMPT"
    );
    println!("{}", "-".repeat(92));

    for snapshot in snapshots {
        let prompt = snapshot.session.prompt.lines().next().unwrap_or("");
        let prompt_display = if prompt.chars().count() > 30 {
            format!("{}...", prompt.chars().take(27).collect::<String>())
        } else {
            prompt.to_string()
        };
        println!(
            "{:<38} {:<11} {:>8}  {}",
            snapshot.session.id,
            snapshot.session.phase.to_string(),
            progress(snapshot),
            prompt_display
        );
    }
}
