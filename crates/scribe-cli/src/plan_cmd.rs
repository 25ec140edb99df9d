//! `scribe plan` command: produce and print an outline without drafting.

use anyhow::{Result, bail};

use scribe_core::Coordinator;
use scribe_core::outline::{PlanOutcome, templates};

/// Run the plan command.
pub async fn run_plan(
    coordinator: &Coordinator,
    prompt: &str,
    template: Option<&str>,
    json: bool,
) -> Result<()> {
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }
    if let Some(id) = template {
        if templates::find(id).is_none() {
            eprintln!("warning: unknown template {id:?}; planning without one");
        }
    }

    match coordinator.plan(prompt, template).await {
        PlanOutcome::Accepted(outline) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&outline)?);
            } else {
                println!("{}", outline.to_markdown());
                eprintln!();
                eprintln!("{} section(s)", outline.section_count());
            }
        }
        PlanOutcome::Fallback { reason, attempts } => {
            eprintln!("Outline rejected after {attempts} attempt(s): {reason}");
            eprintln!("`scribe generate` would draft this document in a single call.");
            std::process::exit(2);
        }
    }
    Ok(())
}

/// Print the built-in templates.
pub fn list_templates() {
    println!("{:<10} {}", "ID", "DESCRIPTION");
    for template in templates::all() {
        println!("{:<10} {}", template.id, template.description);
    }
}
