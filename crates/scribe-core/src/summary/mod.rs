//! Summary Refresher: fold a completed section into the global summary.
//!
//! Whatever the strategy, [`refresh_bounded`] guarantees the size
//! invariant: the next summary's estimate never exceeds the cap, and a
//! failing refresher degrades to extractive compression instead of
//! failing the session.

pub mod extractive;
pub mod generative;

use async_trait::async_trait;
use scribe_store::models::GlobalSummary;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::budget::BudgetRejection;
use crate::tokens::{estimate_tokens, truncate_to_tokens};

pub use extractive::ExtractiveRefresher;
pub use generative::GenerativeRefresher;

/// Which refresher a pipeline uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStrategy {
    #[default]
    Extractive,
    Generative,
}

impl std::str::FromStr for SummaryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extractive" => Ok(Self::Extractive),
            "generative" => Ok(Self::Generative),
            other => Err(format!(
                "unknown summary strategy {other:?} (expected extractive or generative)"
            )),
        }
    }
}

/// Summary configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Hard upper bound on the summary's token estimate.
    pub cap_tokens: u32,
    pub strategy: SummaryStrategy,
    /// Wall-clock limit for one generative refresh call.
    pub timeout_secs: u64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            cap_tokens: 600,
            strategy: SummaryStrategy::Extractive,
            timeout_secs: 30,
        }
    }
}

/// Errors a refresher may report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("summary generation failed: {0}")]
    Generation(String),

    #[error("summary generation timed out after {0}s")]
    TimedOut(u64),

    #[error("summary call does not fit the budget: {0}")]
    BudgetExceeded(BudgetRejection),

    #[error("summary of {tokens} tokens exceeds cap of {cap}")]
    OverCap { tokens: u32, cap: u32 },
}

/// Produces the next summary from the prior one and a completed section.
///
/// Implementations should keep the result under `cap_tokens` and must
/// re-compress rather than append.
#[async_trait]
pub trait SummaryRefresher: Send + Sync {
    fn name(&self) -> &str;

    async fn refresh(
        &self,
        prior: &str,
        section_title: &str,
        section_text: &str,
        cap_tokens: u32,
    ) -> Result<String, RefreshError>;
}

// Compile-time assertion: SummaryRefresher must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn SummaryRefresher) {}
};

/// Run `refresher` and build the successor of `prior`, enforcing the cap.
pub async fn refresh_bounded(
    refresher: &dyn SummaryRefresher,
    prior: &GlobalSummary,
    section_title: &str,
    section_text: &str,
    through_ordinal: usize,
    cap_tokens: u32,
) -> GlobalSummary {
    let text = match refresher
        .refresh(&prior.text, section_title, section_text, cap_tokens)
        .await
    {
        Ok(text) => text,
        Err(e) => {
            warn!(refresher = refresher.name(), error = %e, "summary refresh failed, compressing extractively");
            extractive::compress(&prior.text, section_title, section_text, cap_tokens)
        }
    };

    let text = if estimate_tokens(&text) > cap_tokens {
        warn!(
            refresher = refresher.name(),
            tokens = estimate_tokens(&text),
            cap = cap_tokens,
            "summary over cap, truncating"
        );
        truncate_to_tokens(&text, cap_tokens)
    } else {
        text
    };
    let tokens = estimate_tokens(&text);
    prior.successor(text, tokens, through_ordinal)
}
