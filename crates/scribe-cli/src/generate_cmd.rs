//! `scribe generate` command: draft a whole document, streaming it to stdout.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};

use scribe_core::coordinator::SessionEvent;
use scribe_core::{Coordinator, DocumentRequest};
use scribe_store::models::{SectionState, SessionPhase};

/// Run the generate command.
pub async fn run_generate(
    coordinator: &Coordinator,
    prompt: &str,
    template: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }

    let mut request = DocumentRequest::new(prompt);
    if let Some(id) = template {
        request = request.with_template(id);
    }
    let mut handle = coordinator.start(request).await;
    let session_id = handle.session_id;
    eprintln!("Session {session_id}");
    if let Some(dir) = &coordinator.store().config().snapshot_dir {
        eprintln!("  Snapshots: {}", dir.display());
    }

    // First signal aborts the session, second force-exits.
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);
    let control = coordinator.clone();
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nAborting (Ctrl+C again to force)...");
            // Nobody resumes a CLI session, so abort and release it.
            let stopped = match control.abort(session_id).await {
                Ok(()) => control.release(session_id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = stopped {
                tracing::warn!(session_id = %session_id, error = %e, "abort failed");
            }
        }
    });

    let mut titles: HashMap<usize, String> = HashMap::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = handle.next_event().await {
        match event {
            SessionEvent::OutlineReady { outline } => {
                titles = outline
                    .sections()
                    .into_iter()
                    .enumerate()
                    .map(|(ordinal, node)| {
                        (ordinal, format!("{} {}", node.level.marker(), node.title))
                    })
                    .collect();
                eprintln!("Outline: {} ({} sections)", outline.title, outline.section_count());
            }
            SessionEvent::Fallback { reason } => {
                eprintln!("Outline rejected ({reason}); drafting in one call.");
            }
            SessionEvent::SectionStarted { ordinal, attempt } => {
                if attempt > 1 {
                    eprintln!("\n[section {} attempt {attempt}]", ordinal + 1);
                }
                if let Some(heading) = titles.get(&ordinal) {
                    write!(stdout, "\n{heading}\n\n")?;
                }
            }
            SessionEvent::Increment(increment) => {
                write!(stdout, "{}", increment.text)?;
                stdout.flush()?;
            }
            SessionEvent::SectionCompleted { .. } => {
                writeln!(stdout)?;
            }
            SessionEvent::SectionFailed {
                ordinal,
                error,
                will_retry,
            } => {
                let next = if will_retry { "retrying" } else { "giving up" };
                eprintln!("\n[section {} failed: {error}; {next}]", ordinal + 1);
            }
            SessionEvent::ContextTrimmed { ordinal, steps } => {
                tracing::debug!(ordinal, steps = steps.len(), "context trimmed");
            }
            SessionEvent::Report(report) => {
                eprintln!(
                    "\nCoherence: score {:.2}, {} flag(s)",
                    report.score,
                    report.flags.len()
                );
                for flag in &report.flags {
                    eprintln!(
                        "  - sections {} and {}: {}",
                        flag.section_a + 1,
                        flag.section_b + 1,
                        flag.reason
                    );
                }
            }
            SessionEvent::ReportUnavailable { reason } => {
                eprintln!("\nCoherence report unavailable: {reason}");
            }
            _ => {}
        }
    }

    let outcome = handle.wait().await.context("session task panicked")?;
    if let Some(path) = output {
        std::fs::write(path, outcome.document_text())
            .with_context(|| format!("failed to write document to {}", path.display()))?;
        eprintln!("Document written to {}", path.display());
    }

    match outcome.phase {
        SessionPhase::Completed => {
            eprintln!("\nDocument completed.");
        }
        SessionPhase::Paused | SessionPhase::Planning => {
            eprintln!("\nSession aborted. Completed sections were kept.");
            std::process::exit(130);
        }
        phase => {
            match &outcome.failure {
                Some(failure) => {
                    eprintln!("\nSession {phase} during {}: {}", failure.phase, failure.reason)
                }
                None => eprintln!("\nSession ended {phase}."),
            }
            let kept = outcome
                .sections
                .iter()
                .filter(|s| s.state == SectionState::Completed)
                .count();
            eprintln!("{kept} completed section(s) were kept.");
            std::process::exit(1);
        }
    }

    Ok(())
}
