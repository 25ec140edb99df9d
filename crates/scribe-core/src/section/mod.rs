//! Section Generator: one section's streamed draft.
//!
//! [`SectionGenerator::prepare`] assembles the prompt and fits its context
//! under the budget; [`SectionGenerator::draft`] streams the call as a
//! finite sequence of [`DraftEvent`]s:
//!
//! ```text
//! Increment(seq 0) -> Increment(seq 1) -> ... -> Completed | Failed
//! ```
//!
//! Exactly one terminal event is emitted and nothing follows it. The
//! stream cannot be resumed; a retry prepares and drafts again.

pub mod prompt;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use scribe_store::models::DraftMode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::{BudgetGuard, BudgetRejection, FittedContext, fit_context};
use crate::capability::{GenerationRequest, Generator, Passage};
use crate::tokens::estimate_tokens;

pub use prompt::{SectionBrief, build_fallback_prompt, build_section_prompt, render_context};

/// Section drafting configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionConfig {
    /// Output tokens requested per section call.
    pub max_output_tokens: u32,
    /// Longest gap allowed between two chunks before the stream counts
    /// as stalled.
    pub stall_timeout_ms: u64,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 1024,
            stall_timeout_ms: 30_000,
        }
    }
}

/// Why a section draft failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SectionError {
    #[error("generation stalled: no output for {after_ms}ms")]
    Stalled { after_ms: u64 },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("generation returned no text")]
    Empty,

    #[error("section does not fit the budget: {0}")]
    BudgetExceeded(BudgetRejection),
}

/// Everything needed to draft one section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionRequest {
    pub section_id: Uuid,
    pub brief: SectionBrief,
    pub mode: DraftMode,
    /// Current global summary text.
    pub summary: String,
    /// Retrieval context, best first.
    pub passages: Vec<Passage>,
}

/// A request whose context has been admitted by the budget guard.
#[derive(Debug, Clone)]
pub struct PreparedSection {
    pub section_id: Uuid,
    pub ordinal: usize,
    pub request: GenerationRequest,
    pub prompt_tokens: u32,
    pub fitted: FittedContext,
}

/// One streamed chunk of section text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextIncrement {
    pub section_id: Uuid,
    pub ordinal: usize,
    /// 0-based position within the section's stream.
    pub seq: u64,
    pub text: String,
}

/// Finished section text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDraft {
    pub section_id: Uuid,
    pub text: String,
    /// Estimated tokens consumed: prompt, context and produced output.
    pub tokens: u32,
}

/// Event in a section's draft stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftEvent {
    Increment(TextIncrement),
    Completed(SectionDraft),
    Failed(SectionError),
}

impl DraftEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Increment(_))
    }
}

/// Lazily produced draft events.
pub type DraftStream = Pin<Box<dyn Stream<Item = DraftEvent> + Send>>;

/// Drives one section's streaming generation.
#[derive(Clone)]
pub struct SectionGenerator {
    generator: Arc<dyn Generator>,
    guard: BudgetGuard,
    config: SectionConfig,
}

impl std::fmt::Debug for SectionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionGenerator")
            .field("generator", &self.generator.name())
            .field("config", &self.config)
            .finish()
    }
}

impl SectionGenerator {
    pub fn new(generator: Arc<dyn Generator>, guard: BudgetGuard, config: SectionConfig) -> Self {
        Self {
            generator,
            guard,
            config,
        }
    }

    pub fn config(&self) -> &SectionConfig {
        &self.config
    }

    /// Build the prompt and trim its context until the guard admits it.
    pub fn prepare(&self, request: SectionRequest) -> Result<PreparedSection, BudgetRejection> {
        let fixed = match request.mode {
            DraftMode::Sectioned => build_section_prompt(&request.brief),
            DraftMode::Fallback => build_fallback_prompt(&request.brief),
        };
        let prompt_tokens = estimate_tokens(&fixed);
        let fitted = fit_context(
            &self.guard,
            prompt_tokens,
            request.summary,
            request.passages,
            self.config.max_output_tokens,
            render_context,
        )?;

        let mut full = fixed;
        full.push_str(&fitted.context_block);
        Ok(PreparedSection {
            section_id: request.section_id,
            ordinal: request.brief.ordinal,
            request: GenerationRequest::new(full, self.config.max_output_tokens),
            prompt_tokens,
            fitted,
        })
    }

    /// Stream the prepared call.
    ///
    /// Each chunk must arrive within the stall timeout. Dropping the
    /// returned stream drops the underlying generation stream, which
    /// cancels the external call.
    pub fn draft(&self, prepared: PreparedSection) -> DraftStream {
        let generator = Arc::clone(&self.generator);
        let stall_ms = self.config.stall_timeout_ms;
        let stall = Duration::from_millis(stall_ms);

        let stream = async_stream::stream! {
            let mut chunks = generator.stream(&prepared.request);
            let mut text = String::new();
            let mut seq: u64 = 0;

            loop {
                match tokio::time::timeout(stall, chunks.next()).await {
                    Err(_elapsed) => {
                        yield DraftEvent::Failed(SectionError::Stalled { after_ms: stall_ms });
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        yield DraftEvent::Failed(SectionError::Generation(format!("{e:#}")));
                        return;
                    }
                    Ok(Some(Ok(chunk))) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        text.push_str(&chunk);
                        yield DraftEvent::Increment(TextIncrement {
                            section_id: prepared.section_id,
                            ordinal: prepared.ordinal,
                            seq,
                            text: chunk,
                        });
                        seq += 1;
                    }
                }
            }

            let body = text.trim();
            if body.is_empty() {
                yield DraftEvent::Failed(SectionError::Empty);
                return;
            }
            let tokens = prepared
                .prompt_tokens
                .saturating_add(prepared.fitted.context_tokens)
                .saturating_add(estimate_tokens(body));
            yield DraftEvent::Completed(SectionDraft {
                section_id: prepared.section_id,
                text: body.to_string(),
                tokens,
            });
        };

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::capability::ChunkStream;
    use async_trait::async_trait;

    /// Streams fixed chunks, optionally hanging before the last one.
    struct Chunks {
        chunks: Vec<&'static str>,
        hang_before_last: bool,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Generator for Chunks {
        fn name(&self) -> &str {
            "chunks"
        }

        async fn generate(&self, _request: &GenerationRequest) -> anyhow::Result<String> {
            Ok(self.chunks.concat())
        }

        fn stream(&self, _request: &GenerationRequest) -> ChunkStream {
            let chunks: Vec<String> = self.chunks.iter().map(|c| c.to_string()).collect();
            let hang = self.hang_before_last;
            let fail_after = self.fail_after;
            Box::pin(async_stream::stream! {
                let n = chunks.len();
                for (i, c) in chunks.into_iter().enumerate() {
                    if fail_after == Some(i) {
                        yield Err(anyhow::anyhow!("connection reset"));
                        return;
                    }
                    if hang && i + 1 == n {
                        futures::future::pending::<()>().await;
                    }
                    yield Ok(c);
                }
            })
        }
    }

    fn generator(chunks: Chunks, stall_timeout_ms: u64) -> SectionGenerator {
        SectionGenerator::new(
            Arc::new(chunks),
            BudgetGuard::new(BudgetConfig::default()).unwrap(),
            SectionConfig {
                max_output_tokens: 256,
                stall_timeout_ms,
            },
        )
    }

    fn request(summary: &str, passages: Vec<Passage>) -> SectionRequest {
        SectionRequest {
            section_id: Uuid::new_v4(),
            brief: SectionBrief {
                document_title: "Doc".to_string(),
                document_prompt: "write it".to_string(),
                outline_markdown: "## A\n- a\n## B\n- b\n".to_string(),
                title: "B".to_string(),
                bullets: vec!["b".to_string()],
                ordinal: 1,
                total_sections: 2,
                template_id: None,
            },
            mode: DraftMode::Sectioned,
            summary: summary.to_string(),
            passages,
        }
    }

    #[tokio::test]
    async fn streams_increments_then_completes() {
        let g = generator(
            Chunks {
                chunks: vec!["Hello ", "", "world."],
                hang_before_last: false,
                fail_after: None,
            },
            1_000,
        );
        let prepared = g.prepare(request("- [A] Earlier text.", vec![])).unwrap();
        assert!(prepared.request.prompt.contains("Earlier text."));
        let events: Vec<DraftEvent> = g.draft(prepared).collect().await;

        assert_eq!(events.len(), 3);
        match &events[1] {
            DraftEvent::Increment(inc) => {
                assert_eq!(inc.seq, 1);
                assert_eq!(inc.ordinal, 1);
                assert_eq!(inc.text, "world.");
            }
            other => panic!("expected increment, got {other:?}"),
        }
        match &events[2] {
            DraftEvent::Completed(draft) => {
                assert_eq!(draft.text, "Hello world.");
                assert!(draft.tokens > estimate_tokens("Hello world."));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn stall_fails_the_section() {
        let g = generator(
            Chunks {
                chunks: vec!["partial ", "never arrives"],
                hang_before_last: true,
                fail_after: None,
            },
            50,
        );
        let prepared = g.prepare(request("", vec![])).unwrap();
        let events: Vec<DraftEvent> = g.draft(prepared).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            DraftEvent::Failed(SectionError::Stalled { after_ms: 50 })
        );
    }

    #[tokio::test]
    async fn generation_error_fails_the_section() {
        let g = generator(
            Chunks {
                chunks: vec!["a", "b"],
                hang_before_last: false,
                fail_after: Some(1),
            },
            1_000,
        );
        let prepared = g.prepare(request("", vec![])).unwrap();
        let events: Vec<DraftEvent> = g.draft(prepared).collect().await;
        assert!(matches!(
            events.last(),
            Some(DraftEvent::Failed(SectionError::Generation(msg))) if msg.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn whitespace_only_output_is_empty() {
        let g = generator(
            Chunks {
                chunks: vec!["  ", "\n"],
                hang_before_last: false,
                fail_after: None,
            },
            1_000,
        );
        let prepared = g.prepare(request("", vec![])).unwrap();
        let events: Vec<DraftEvent> = g.draft(prepared).collect().await;
        assert_eq!(events.last(), Some(&DraftEvent::Failed(SectionError::Empty)));
    }

    #[test]
    fn prepare_trims_passages_to_fit() {
        let g = SectionGenerator::new(
            Arc::new(Chunks {
                chunks: vec![],
                hang_before_last: false,
                fail_after: None,
            }),
            BudgetGuard::new(BudgetConfig {
                ceiling: 700,
                warning_fraction: 0.9,
            })
            .unwrap(),
            SectionConfig {
                max_output_tokens: 256,
                stall_timeout_ms: 1_000,
            },
        );
        let big = |s: &str| Passage {
            source: s.to_string(),
            text: "evidence ".repeat(100),
            score: 1.0,
        };
        let prepared = g.prepare(request("", vec![big("first"), big("second")])).unwrap();
        assert!(!prepared.fitted.steps.is_empty());
        assert!(prepared.fitted.total <= 700);
        assert!(!prepared.request.prompt.contains("[second]"));
    }

    #[test]
    fn prepare_rejects_when_prompt_alone_is_too_big() {
        let g = SectionGenerator::new(
            Arc::new(Chunks {
                chunks: vec![],
                hang_before_last: false,
                fail_after: None,
            }),
            BudgetGuard::new(BudgetConfig {
                ceiling: 100,
                warning_fraction: 0.9,
            })
            .unwrap(),
            SectionConfig::default(),
        );
        assert!(g.prepare(request("summary", vec![])).is_err());
    }
}
