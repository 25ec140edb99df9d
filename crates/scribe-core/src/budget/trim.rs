//! Context trimming: shrink the optional parts of a call until it fits.
//!
//! Retrieval passages go first, lowest-ranked first. Only when no passages
//! remain is the summary truncated. The fixed prompt and the requested
//! output are never touched; if they alone exceed the ceiling the call is
//! rejected.

use serde::{Deserialize, Serialize};

use crate::capability::Passage;
use crate::tokens::{estimate_tokens, truncate_to_tokens};

use super::{Admission, BudgetGuard, BudgetRejection};

/// One trimming action taken to make a call fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrimStep {
    DroppedPassage { source: String, tokens: u32 },
    TruncatedSummary { from_tokens: u32, to_tokens: u32 },
}

/// Context that the guard admitted, plus how it got there.
#[derive(Debug, Clone)]
pub struct FittedContext {
    pub summary: String,
    pub passages: Vec<Passage>,
    /// `render(summary, passages)` for the admitted parts.
    pub context_block: String,
    pub context_tokens: u32,
    pub total: u64,
    pub near_limit: bool,
    pub steps: Vec<TrimStep>,
}

/// Trim `summary` and `passages` until the guard admits the call.
///
/// `render` turns the context parts into the text that will be sent; its
/// estimate is what the guard is asked about, so formatting overhead is
/// accounted for. `passages` must be ordered best-first.
pub fn fit_context<F>(
    guard: &BudgetGuard,
    prompt_tokens: u32,
    summary: String,
    passages: Vec<Passage>,
    output_tokens: u32,
    render: F,
) -> Result<FittedContext, BudgetRejection>
where
    F: Fn(&str, &[Passage]) -> String,
{
    let mut summary = summary;
    let mut passages = passages;
    let mut steps = Vec::new();

    loop {
        let context_block = render(&summary, &passages);
        let context_tokens = estimate_tokens(&context_block);
        let rejection = match guard.admit(prompt_tokens, context_tokens, output_tokens) {
            Admission::Allow { total, near_limit } => {
                return Ok(FittedContext {
                    summary,
                    passages,
                    context_block,
                    context_tokens,
                    total,
                    near_limit,
                    steps,
                });
            }
            Admission::Reject(rejection) => rejection,
        };

        if let Some(dropped) = passages.pop() {
            steps.push(TrimStep::DroppedPassage {
                tokens: estimate_tokens(&dropped.text),
                source: dropped.source,
            });
            continue;
        }

        let summary_tokens = estimate_tokens(&summary);
        if summary_tokens == 0 {
            return Err(rejection);
        }
        let overflow = u32::try_from(rejection.overflow()).unwrap_or(u32::MAX);
        let target = summary_tokens.saturating_sub(overflow.max(1));
        let cut = truncate_to_tokens(&summary, target);
        steps.push(TrimStep::TruncatedSummary {
            from_tokens: summary_tokens,
            to_tokens: estimate_tokens(&cut),
        });
        summary = cut;
    }
}
