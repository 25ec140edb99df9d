//! Outline planning: prompt construction, the bounded planning call and
//! the accept / retry / fallback decision.

use std::sync::Arc;
use std::time::Duration;

use scribe_store::models::Outline;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::budget::{Admission, BudgetGuard};
use crate::capability::{GenerationRequest, Generator};
use crate::tokens::estimate_tokens;

use super::parser::parse_outline;
use super::quality::{QualityGate, describe};
use super::templates::{self, Template};

/// Planning attempts before falling back to a single-shot draft.
pub const MAX_PLAN_ATTEMPTS: u32 = 2;

/// Planner configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Fewest sections an accepted outline may have.
    pub min_sections: usize,
    /// Bullets required on every leaf heading.
    pub min_bullets: usize,
    /// Output tokens requested for the outline.
    pub max_output_tokens: u32,
    /// Wall-clock limit for one planning call.
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_sections: 3,
            min_bullets: 1,
            max_output_tokens: 1024,
            timeout_secs: 30,
        }
    }
}

impl PlannerConfig {
    pub fn gate(&self) -> QualityGate {
        QualityGate {
            min_sections: self.min_sections,
            min_bullets: self.min_bullets,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Result of planning: an accepted outline or a signal to draft the
/// whole document in one call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Accepted(Outline),
    Fallback { reason: String, attempts: u32 },
}

impl PlanOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// Document title used when the outline does not provide one.
pub fn title_from_prompt(prompt: &str) -> String {
    let first = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("Untitled");
    let mut title: String = first.trim().chars().take(80).collect();
    if title.is_empty() {
        title.push_str("Untitled");
    }
    title
}

/// Build the planning prompt.
///
/// `rejection` carries the reason the previous attempt was rejected.
pub fn build_planning_prompt(
    prompt: &str,
    template: Option<&Template>,
    config: &PlannerConfig,
    rejection: Option<&str>,
) -> String {
    let mut out = String::with_capacity(1024 + prompt.len());

    out.push_str("You are planning the structure of a long document.\n");
    out.push_str("Produce an outline in Markdown for the request below.\n\n");
    out.push_str("Rules:\n");
    out.push_str("- Start with one `# Title` line.\n");
    out.push_str("- Use `##` for sections and `###` for subsections.\n");
    out.push_str(&format!(
        "- Under every heading list {} to 4 `- ` bullets naming what it must cover.\n",
        config.min_bullets.max(1)
    ));
    out.push_str(&format!(
        "- Write at least {} sections with distinct headings.\n",
        config.min_sections
    ));
    out.push_str("- Output only the outline.\n\n");

    if let Some(t) = template {
        out.push_str(&format!("Template: {} ({})\n", t.id, t.description));
        out.push_str("Suggested headings: ");
        out.push_str(&t.skeleton.join(", "));
        out.push('\n');
        out.push_str(&format!("Style: {}\n\n", t.style));
    }

    if let Some(reason) = rejection {
        out.push_str(&format!(
            "Your previous outline was rejected: {reason}. Fix these problems.\n\n"
        ));
    }

    out.push_str("Request:\n");
    out.push_str(prompt.trim());
    out.push('\n');
    out
}

/// Turns a prompt into an outline with one retry, then fallback.
#[derive(Clone)]
pub struct OutlinePlanner {
    generator: Arc<dyn Generator>,
    guard: BudgetGuard,
    config: PlannerConfig,
}

impl std::fmt::Debug for OutlinePlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutlinePlanner")
            .field("generator", &self.generator.name())
            .field("config", &self.config)
            .finish()
    }
}

impl OutlinePlanner {
    pub fn new(generator: Arc<dyn Generator>, guard: BudgetGuard, config: PlannerConfig) -> Self {
        Self {
            generator,
            guard,
            config,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan a document. Never fails: every problem ends in
    /// [`PlanOutcome::Fallback`].
    pub async fn plan(&self, prompt: &str, template_id: Option<&str>) -> PlanOutcome {
        let template = match template_id {
            Some(id) => {
                let found = templates::find(id);
                if found.is_none() {
                    warn!(template_id = id, "unknown template, planning without one");
                }
                found
            }
            None => None,
        };
        let fallback_title = title_from_prompt(prompt);
        let gate = self.config.gate();

        let mut rejection: Option<String> = None;
        for attempt in 1..=MAX_PLAN_ATTEMPTS {
            let planning_prompt =
                build_planning_prompt(prompt, template, &self.config, rejection.as_deref());
            let prompt_tokens = estimate_tokens(&planning_prompt);
            if let Admission::Reject(r) =
                self.guard.admit(prompt_tokens, 0, self.config.max_output_tokens)
            {
                warn!(error = %r, "planning call exceeds budget");
                return PlanOutcome::Fallback {
                    reason: format!("planning call over budget: {r}"),
                    attempts: attempt - 1,
                };
            }

            let request = GenerationRequest::new(planning_prompt, self.config.max_output_tokens);
            let reply = tokio::time::timeout(self.config.timeout(), self.generator.generate(&request))
                .await;

            let reason = match reply {
                Err(_elapsed) => format!("planning call timed out after {}s", self.config.timeout_secs),
                Ok(Err(e)) => format!("planning call failed: {e:#}"),
                Ok(Ok(text)) => {
                    match parse_outline(&text, &fallback_title, template.map(|t| t.id.to_string())) {
                        Err(e) => e.to_string(),
                        Ok(outline) => {
                            let issues = gate.assess(&outline);
                            if issues.is_empty() {
                                info!(
                                    attempt,
                                    sections = outline.section_count(),
                                    "outline accepted"
                                );
                                return PlanOutcome::Accepted(outline);
                            }
                            describe(&issues)
                        }
                    }
                }
            };
            warn!(attempt, reason = %reason, "outline rejected");
            rejection = Some(reason);
        }

        let reason = rejection.unwrap_or_else(|| "outline rejected".to_string());
        debug!(reason = %reason, "falling back to single-shot draft");
        PlanOutcome::Fallback {
            reason,
            attempts: MAX_PLAN_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_mentions_rules_and_request() {
        let config = PlannerConfig::default();
        let p = build_planning_prompt("write a 3-section report", None, &config, None);
        assert!(p.contains("Produce an outline"));
        assert!(p.contains("at least 3 sections"));
        assert!(p.ends_with("write a 3-section report\n"));
        assert!(!p.contains("Template:"));
        assert!(!p.contains("rejected"));
    }

    #[test]
    fn prompt_includes_template_and_rejection() {
        let config = PlannerConfig::default();
        let t = templates::find("tutorial");
        let p = build_planning_prompt("install rust", t, &config, Some("outline has a single section"));
        assert!(p.contains("Template: tutorial"));
        assert!(p.contains("Prerequisites"));
        assert!(p.contains("previous outline was rejected: outline has a single section"));
    }

    #[test]
    fn title_from_prompt_uses_first_line() {
        assert_eq!(title_from_prompt("\n  A history of tea\nmore"), "A history of tea");
        assert_eq!(title_from_prompt("   "), "Untitled");
        assert_eq!(title_from_prompt(&"x".repeat(200)).len(), 80);
    }
}
