//! Token budget guard for generation calls.
//!
//! Every call to the generation capability goes through
//! [`BudgetGuard::admit`] first. The guard is pure: it never trims, logs or
//! remembers anything. A rejection is ordinary control flow; callers trim
//! context with [`fit_context`] and ask again.

pub mod trim;

use serde::{Deserialize, Serialize};

pub use trim::{FittedContext, TrimStep, fit_context};

/// Budget configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum prompt + context + requested output for a single call.
    pub ceiling: u32,
    /// Fraction of the ceiling at which callers are warned.
    pub warning_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            ceiling: 8192,
            warning_fraction: 0.9,
        }
    }
}

/// Invalid budget configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BudgetConfigError {
    #[error("budget ceiling must be greater than zero")]
    ZeroCeiling,

    #[error("warning fraction must be in (0, 1], got {0}")]
    InvalidWarningFraction(f64),
}

/// Why a call was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "call needs {total} tokens (prompt {prompt} + context {context} + output {output}), ceiling is {ceiling}"
)]
pub struct BudgetRejection {
    pub prompt: u32,
    pub context: u32,
    pub output: u32,
    pub total: u64,
    pub ceiling: u32,
}

impl BudgetRejection {
    /// Tokens that would have to be removed for the call to fit.
    pub fn overflow(&self) -> u64 {
        self.total.saturating_sub(u64::from(self.ceiling))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow {
        total: u64,
        /// `total` has reached the warning threshold.
        near_limit: bool,
    },
    Reject(BudgetRejection),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Decides whether a call fits under the context ceiling.
///
/// Stateless apart from its configuration; share it freely across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetGuard {
    ceiling: u32,
    warning_threshold: u32,
}

impl BudgetGuard {
    pub fn new(config: BudgetConfig) -> Result<Self, BudgetConfigError> {
        if config.ceiling == 0 {
            return Err(BudgetConfigError::ZeroCeiling);
        }
        if !(config.warning_fraction > 0.0 && config.warning_fraction <= 1.0) {
            return Err(BudgetConfigError::InvalidWarningFraction(
                config.warning_fraction,
            ));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let warning_threshold = (f64::from(config.ceiling) * config.warning_fraction).floor() as u32;
        Ok(Self {
            ceiling: config.ceiling,
            warning_threshold: warning_threshold.min(config.ceiling),
        })
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Token total at which a call counts as approaching the limit.
    pub fn warning_threshold(&self) -> u32 {
        self.warning_threshold
    }

    /// Whether `total` has reached the warning threshold.
    pub fn is_near_limit(&self, total: u64) -> bool {
        total >= u64::from(self.warning_threshold)
    }

    /// Admit a call iff `prompt + context + output <= ceiling`.
    pub fn admit(&self, prompt_tokens: u32, context_tokens: u32, output_tokens: u32) -> Admission {
        let total =
            u64::from(prompt_tokens) + u64::from(context_tokens) + u64::from(output_tokens);
        if total <= u64::from(self.ceiling) {
            Admission::Allow {
                total,
                near_limit: self.is_near_limit(total),
            }
        } else {
            Admission::Reject(BudgetRejection {
                prompt: prompt_tokens,
                context: context_tokens,
                output: output_tokens,
                total,
                ceiling: self.ceiling,
            })
        }
    }
}
