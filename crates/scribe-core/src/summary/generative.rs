//! Generative summary refresh through the generation capability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::budget::{Admission, BudgetGuard};
use crate::capability::{GenerationRequest, Generator};
use crate::tokens::estimate_tokens;

use super::{RefreshError, SummaryRefresher, extractive};

/// Build the merge prompt.
pub fn build_refresh_prompt(prior: &str, section_title: &str, section_text: &str, cap_tokens: u32) -> String {
    let mut out = String::with_capacity(512 + prior.len() + section_text.len());
    out.push_str("Merge the new section into the running summary of a document being written.\n");
    out.push_str(&format!(
        "The result replaces the old summary entirely and must stay under {cap_tokens} tokens.\n"
    ));
    out.push_str(
        "Keep named entities, numbers, stated constraints and open threads later sections \
         will need. Drop wording, examples and repetition.\n",
    );
    out.push_str("Write one fact per line as `- [Section title] fact`. Output only the summary.\n\n");
    if !prior.trim().is_empty() {
        out.push_str("Current summary:\n");
        out.push_str(prior.trim());
        out.push_str("\n\n");
    }
    out.push_str(&format!("New section \"{section_title}\":\n"));
    out.push_str(section_text.trim());
    out.push('\n');
    out
}

/// Asks the model to merge; falls back to extractive compression on any
/// failure or over-cap result.
#[derive(Clone)]
pub struct GenerativeRefresher {
    generator: Arc<dyn Generator>,
    guard: BudgetGuard,
    timeout: Duration,
}

impl std::fmt::Debug for GenerativeRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerativeRefresher")
            .field("generator", &self.generator.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GenerativeRefresher {
    pub fn new(generator: Arc<dyn Generator>, guard: BudgetGuard, timeout: Duration) -> Self {
        Self {
            generator,
            guard,
            timeout,
        }
    }

    /// One merge call, without fallback.
    pub async fn merge(
        &self,
        prior: &str,
        section_title: &str,
        section_text: &str,
        cap_tokens: u32,
    ) -> Result<String, RefreshError> {
        let prompt = build_refresh_prompt(prior, section_title, section_text, cap_tokens);
        if let Admission::Reject(r) = self.guard.admit(estimate_tokens(&prompt), 0, cap_tokens) {
            return Err(RefreshError::BudgetExceeded(r));
        }
        let request = GenerationRequest::new(prompt, cap_tokens);
        let text = tokio::time::timeout(self.timeout, self.generator.generate(&request))
            .await
            .map_err(|_| RefreshError::TimedOut(self.timeout.as_secs()))?
            .map_err(|e| RefreshError::Generation(format!("{e:#}")))?;
        let text = text.trim().to_string();
        let tokens = estimate_tokens(&text);
        if tokens > cap_tokens {
            return Err(RefreshError::OverCap {
                tokens,
                cap: cap_tokens,
            });
        }
        if text.is_empty() {
            return Err(RefreshError::Generation("empty summary".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl SummaryRefresher for GenerativeRefresher {
    fn name(&self) -> &str {
        "generative"
    }

    async fn refresh(
        &self,
        prior: &str,
        section_title: &str,
        section_text: &str,
        cap_tokens: u32,
    ) -> Result<String, RefreshError> {
        match self.merge(prior, section_title, section_text, cap_tokens).await {
            Ok(text) => {
                debug!(tokens = estimate_tokens(&text), "generative summary accepted");
                Ok(text)
            }
            Err(e) => {
                warn!(error = %e, "generative summary rejected, compressing extractively");
                Ok(extractive::compress(prior, section_title, section_text, cap_tokens))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::capability::ChunkStream;

    struct Fixed(&'static str);

    #[async_trait]
    impl Generator for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, _request: &GenerationRequest) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }

        fn stream(&self, _request: &GenerationRequest) -> ChunkStream {
            Box::pin(futures::stream::iter(vec![Ok(self.0.to_string())]))
        }
    }

    fn refresher(reply: &'static str, ceiling: u32) -> GenerativeRefresher {
        GenerativeRefresher::new(
            Arc::new(Fixed(reply)),
            BudgetGuard::new(BudgetConfig {
                ceiling,
                warning_fraction: 0.9,
            })
            .unwrap(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn prompt_contains_parts() {
        let p = build_refresh_prompt("- [Intro] A.", "Body", "Body text.", 300);
        assert!(p.contains("under 300 tokens"));
        assert!(p.contains("Current summary:\n- [Intro] A."));
        assert!(p.contains("New section \"Body\":\nBody text."));
    }

    #[tokio::test]
    async fn accepts_model_summary_within_cap() {
        let r = refresher("- [Body] Acme grew 4%.", 8192);
        let out = r.refresh("", "Body", "Acme grew 4% this year.", 100).await.unwrap();
        assert_eq!(out, "- [Body] Acme grew 4%.");
    }

    #[tokio::test]
    async fn over_cap_reply_falls_back() {
        let long: &'static str = Box::leak("word ".repeat(500).into_boxed_str());
        let r = refresher(long, 8192);
        assert!(matches!(
            r.merge("", "Body", "Acme grew 4% this year.", 50).await,
            Err(RefreshError::OverCap { .. })
        ));
        let out = r.refresh("", "Body", "Acme grew 4% this year.", 50).await.unwrap();
        assert_eq!(out, "- [Body] Acme grew 4% this year.");
    }

    #[tokio::test]
    async fn budget_rejection_falls_back() {
        let r = refresher("- [Body] fine.", 60);
        assert!(matches!(
            r.merge("", "Body", "Acme grew 4% this year.", 50).await,
            Err(RefreshError::BudgetExceeded(_))
        ));
        let out = r.refresh("", "Body", "Acme grew 4% this year.", 50).await.unwrap();
        assert!(out.starts_with("- [Body]"));
    }
}
