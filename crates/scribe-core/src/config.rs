//! Pipeline configuration.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [budget]
//! ceiling = 8192
//! warning_fraction = 0.9
//!
//! [summary]
//! cap_tokens = 600
//! strategy = "extractive"
//!
//! [coherence]
//! block_on_flags = false
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::{BudgetConfig, BudgetConfigError, BudgetGuard};
use crate::coherence::CoherenceConfig;
use crate::outline::PlannerConfig;
use crate::section::SectionConfig;
use crate::summary::SummaryConfig;

/// Retrieval settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Passages requested per section.
    pub limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { limit: 4 }
    }
}

/// Section retry pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_ms: u64,
    /// Upper bound of the random delay added to the backoff.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 500,
            jitter_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Backoff plus a random jitter in `[0, jitter_ms]`.
    pub fn delay(&self) -> Duration {
        use rand::Rng;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.backoff_ms.saturating_add(jitter))
    }
}

/// Session event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of each session's event queue. A full queue makes the
    /// session wait; events are never dropped while a receiver exists.
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer: 64 }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub budget: BudgetConfig,
    pub planner: PlannerConfig,
    pub section: SectionConfig,
    pub summary: SummaryConfig,
    pub coherence: CoherenceConfig,
    pub retrieval: RetrievalConfig,
    pub retry: RetryConfig,
    pub events: EventsConfig,
}

/// Invalid pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse pipeline config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Budget(#[from] BudgetConfigError),

    #[error("summary cap ({cap}) must be smaller than the budget ceiling ({ceiling})")]
    SummaryCapTooLarge { cap: u32, ceiling: u32 },

    #[error("{what} output ({tokens} tokens) must be smaller than the budget ceiling ({ceiling})")]
    OutputTooLarge {
        what: &'static str,
        tokens: u32,
        ceiling: u32,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("coherence thresholds out of range: {0}")]
    Coherence(String),
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let guard = BudgetGuard::new(self.budget)?;
        let ceiling = guard.ceiling();

        if self.summary.cap_tokens >= ceiling {
            return Err(ConfigError::SummaryCapTooLarge {
                cap: self.summary.cap_tokens,
                ceiling,
            });
        }
        for (what, tokens) in [
            ("planner", self.planner.max_output_tokens),
            ("section", self.section.max_output_tokens),
        ] {
            if tokens == 0 {
                return Err(ConfigError::Zero(what));
            }
            if tokens >= ceiling {
                return Err(ConfigError::OutputTooLarge {
                    what,
                    tokens,
                    ceiling,
                });
            }
        }
        if self.summary.cap_tokens == 0 {
            return Err(ConfigError::Zero("summary.cap_tokens"));
        }
        if self.section.stall_timeout_ms == 0 {
            return Err(ConfigError::Zero("section.stall_timeout_ms"));
        }
        if self.planner.timeout_secs == 0 {
            return Err(ConfigError::Zero("planner.timeout_secs"));
        }
        if self.planner.min_sections == 0 {
            return Err(ConfigError::Zero("planner.min_sections"));
        }
        if self.events.buffer == 0 {
            return Err(ConfigError::Zero("events.buffer"));
        }
        let c = &self.coherence;
        if !(0.0..=1.0).contains(&c.min_adjacent_similarity) {
            return Err(ConfigError::Coherence(format!(
                "min_adjacent_similarity {} not in [0, 1]",
                c.min_adjacent_similarity
            )));
        }
        if c.max_style_ratio.is_nan() || c.max_style_ratio < 1.0 {
            return Err(ConfigError::Coherence(format!(
                "max_style_ratio {} must be at least 1",
                c.max_style_ratio
            )));
        }
        Ok(())
    }

    /// The budget guard for this configuration.
    pub fn guard(&self) -> Result<BudgetGuard, ConfigError> {
        Ok(BudgetGuard::new(self.budget)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::SummaryStrategy;

    #[test]
    fn empty_document_is_default() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.budget.ceiling, 8192);
        assert_eq!(config.summary.cap_tokens, 600);
        assert!(!config.coherence.block_on_flags);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [budget]
            ceiling = 4096

            [summary]
            strategy = "generative"

            [coherence]
            block_on_flags = true
            "#,
        )
        .unwrap();
        assert_eq!(config.budget.ceiling, 4096);
        assert_eq!(config.budget.warning_fraction, 0.9);
        assert_eq!(config.summary.strategy, SummaryStrategy::Generative);
        assert_eq!(config.summary.cap_tokens, 600);
        assert!(config.coherence.block_on_flags);
    }

    #[test]
    fn rejects_zero_ceiling() {
        let err = PipelineConfig::from_toml_str("[budget]\nceiling = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Budget(BudgetConfigError::ZeroCeiling)));
    }

    #[test]
    fn rejects_bad_warning_fraction() {
        let err = PipelineConfig::from_toml_str("[budget]\nwarning_fraction = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Budget(BudgetConfigError::InvalidWarningFraction(_))));
    }

    #[test]
    fn rejects_summary_cap_at_ceiling() {
        let err = PipelineConfig::from_toml_str("[budget]\nceiling = 600\n").unwrap_err();
        assert!(matches!(err, ConfigError::SummaryCapTooLarge { .. }));
    }

    #[test]
    fn rejects_zero_event_buffer() {
        let err = PipelineConfig::from_toml_str("[events]\nbuffer = 0\n").unwrap_err();
        assert_eq!(err.to_string(), "events.buffer must be greater than zero");
    }

    #[test]
    fn rejects_unknown_strategy() {
        let err = PipelineConfig::from_toml_str("[summary]\nstrategy = \"magic\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn retry_delay_within_bounds() {
        let retry = RetryConfig {
            backoff_ms: 100,
            jitter_ms: 50,
        };
        for _ in 0..50 {
            let d = retry.delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
        let fixed = RetryConfig {
            backoff_ms: 10,
            jitter_ms: 0,
        };
        assert_eq!(fixed.delay(), Duration::from_millis(10));
    }

    #[test]
    fn serializes_back_to_toml() {
        let text = toml::to_string_pretty(&PipelineConfig::default()).unwrap();
        assert!(text.contains("[budget]"));
        assert_eq!(PipelineConfig::from_toml_str(&text).unwrap(), PipelineConfig::default());
    }
}
