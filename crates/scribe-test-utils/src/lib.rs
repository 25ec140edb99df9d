//! Deterministic capabilities for scribe tests.
//!
//! [`ScriptedGenerator`] answers prompts by substring rules and can be told
//! to stall, fail or wait at a [`Gate`] a given number of times, which is
//! enough to drive every coordinator path without a model. Every prompt it
//! receives is logged so tests can assert on what was sent.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use scribe_core::capability::{ChunkStream, GenerationRequest, Generator, Passage, Retriever};
use scribe_core::config::{PipelineConfig, RetryConfig};

/// Marker present in every planning prompt.
pub const PLANNING_MARKER: &str = "Produce an outline";

/// Marker present in every single-shot fallback prompt.
pub const FALLBACK_MARKER: &str = "Write the complete document";

/// A valid three-section report outline.
pub const REPORT_OUTLINE: &str = "\
# Quarterly Report

## Intro
- scope of the quarter
- main question

## Body
- revenue figures
- regional results

## Conclusion
- outlook for next quarter
";

/// Substring that identifies the drafting prompt for `title`.
pub fn section_needle(title: &str) -> String {
    format!("Write the section \"{title}\"")
}

/// Pipeline configuration with short timeouts and retry delays.
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.planner.timeout_secs = 2;
    config.section.stall_timeout_ms = 200;
    config.summary.timeout_secs = 2;
    config.retry = RetryConfig {
        backoff_ms: 5,
        jitter_ms: 5,
    };
    config
}

pub fn passage(source: &str, text: &str) -> Passage {
    Passage {
        source: source.to_string(),
        text: text.to_string(),
        score: 1.0,
    }
}

// ===========================================================================
// Gate
// ===========================================================================

/// A latch a scripted reply waits on. Closed until [`Gate::open`].
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

// ===========================================================================
// ScriptedGenerator
// ===========================================================================

#[derive(Debug)]
struct Rule {
    needle: String,
    reply: String,
    stalls: AtomicU32,
    failures: AtomicU32,
    gate: Option<(usize, Gate)>,
}

impl Rule {
    fn new(needle: String) -> Self {
        Self {
            needle,
            reply: String::new(),
            stalls: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            gate: None,
        }
    }
}

/// What one call will do.
enum Behaviour {
    Stall,
    Fail(String),
    Reply {
        chunks: Vec<String>,
        gate: Option<(usize, Gate)>,
    },
}

/// Take one from `counter` if it is positive.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Split into word chunks, keeping the spaces.
fn chunk(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

/// Generation capability driven by prompt substrings.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    outlines: Vec<String>,
    outline_calls: AtomicU32,
    rules: Vec<Rule>,
    default_reply: String,
    chunk_delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            default_reply: "Nothing was scripted for this prompt.".to_string(),
            ..Self::default()
        }
    }

    /// Queue a reply for planning prompts. Replies are used in order; the
    /// last one repeats.
    pub fn with_outline(mut self, markdown: &str) -> Self {
        self.outlines.push(markdown.to_string());
        self
    }

    /// Reply for the drafting prompt of the section titled `title`.
    pub fn with_section(self, title: &str, text: &str) -> Self {
        self.reply(&section_needle(title), text)
    }

    /// Reply for prompts containing `needle`.
    pub fn reply(mut self, needle: &str, text: &str) -> Self {
        self.rule(needle).reply = text.to_string();
        self
    }

    /// The first `times` matching calls produce no output at all.
    pub fn stall(mut self, needle: &str, times: u32) -> Self {
        self.rule(needle).stalls = AtomicU32::new(times);
        self
    }

    /// The first `times` matching calls fail.
    pub fn fail(mut self, needle: &str, times: u32) -> Self {
        self.rule(needle).failures = AtomicU32::new(times);
        self
    }

    /// Matching replies emit `after_chunks` chunks, then wait for `gate`.
    pub fn gate(mut self, needle: &str, after_chunks: usize, gate: Gate) -> Self {
        self.rule(needle).gate = Some((after_chunks, gate));
        self
    }

    /// Reply for prompts no rule matches.
    pub fn with_default_reply(mut self, text: &str) -> Self {
        self.default_reply = text.to_string();
        self
    }

    /// Delay before each streamed chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn rule(&mut self, needle: &str) -> &mut Rule {
        let index = match self.rules.iter().position(|r| r.needle == needle) {
            Some(i) => i,
            None => {
                self.rules.push(Rule::new(needle.to_string()));
                self.rules.len() - 1
            }
        };
        &mut self.rules[index]
    }

    /// Every prompt received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Prompts containing `needle`, in order.
    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|p| p.contains(needle))
            .collect()
    }

    fn resolve(&self, prompt: &str) -> Behaviour {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());

        let rule = self.rules.iter().find(|r| prompt.contains(&r.needle));
        if let Some(rule) = rule {
            if take_one(&rule.stalls) {
                return Behaviour::Stall;
            }
            if take_one(&rule.failures) {
                return Behaviour::Fail(format!("scripted failure for {:?}", rule.needle));
            }
        }
        let gate = rule.and_then(|r| r.gate.clone());

        // Planning prompts always get the queued outlines.
        if prompt.contains(PLANNING_MARKER) {
            let n = self.outline_calls.fetch_add(1, Ordering::SeqCst) as usize;
            let reply = self
                .outlines
                .get(n)
                .or_else(|| self.outlines.last())
                .cloned()
                .unwrap_or_default();
            return Behaviour::Reply {
                chunks: chunk(&reply),
                gate,
            };
        }

        let reply = rule.map_or(self.default_reply.as_str(), |r| r.reply.as_str());
        Behaviour::Reply {
            chunks: chunk(reply),
            gate,
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        match self.resolve(&request.prompt) {
            Behaviour::Stall => {
                futures::future::pending::<()>().await;
                Ok(String::new())
            }
            Behaviour::Fail(msg) => Err(anyhow::anyhow!(msg)),
            Behaviour::Reply { chunks, gate } => {
                if let Some((_, gate)) = gate {
                    gate.wait().await;
                }
                Ok(chunks.concat())
            }
        }
    }

    fn stream(&self, request: &GenerationRequest) -> ChunkStream {
        let behaviour = self.resolve(&request.prompt);
        let delay = self.chunk_delay;
        Box::pin(async_stream::stream! {
            match behaviour {
                Behaviour::Stall => {
                    futures::future::pending::<()>().await;
                }
                Behaviour::Fail(msg) => {
                    yield Err(anyhow::anyhow!(msg));
                }
                Behaviour::Reply { chunks, gate } => {
                    for (i, chunk) in chunks.into_iter().enumerate() {
                        if let Some((after, gate)) = &gate {
                            if i == *after {
                                gate.wait().await;
                            }
                        }
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        yield Ok(chunk);
                    }
                }
            }
        })
    }
}

// ===========================================================================
// StaticRetriever
// ===========================================================================

/// Returns the same ranked passages for every query, or always fails.
#[derive(Debug, Default)]
pub struct StaticRetriever {
    passages: Vec<Passage>,
    failing: bool,
    queries: Mutex<Vec<String>>,
}

impl StaticRetriever {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self {
            passages,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, query: &str, limit: usize) -> anyhow::Result<Vec<Passage>> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query.to_string());
        if self.failing {
            anyhow::bail!("retrieval index unavailable");
        }
        Ok(self.passages.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt, 100)
    }

    #[tokio::test]
    async fn outlines_are_used_in_order_then_repeat() {
        let g = ScriptedGenerator::new().with_outline("first").with_outline("second");
        let p = format!("{PLANNING_MARKER} please");
        assert_eq!(g.generate(&request(&p)).await.unwrap(), "first");
        assert_eq!(g.generate(&request(&p)).await.unwrap(), "second");
        assert_eq!(g.generate(&request(&p)).await.unwrap(), "second");
        assert_eq!(g.calls_matching(PLANNING_MARKER).len(), 3);
    }

    #[tokio::test]
    async fn failures_are_consumed_before_replies() {
        let g = ScriptedGenerator::new()
            .with_section("Body", "The body text.")
            .fail(&section_needle("Body"), 1);
        let p = section_needle("Body");

        let first: Vec<_> = g.stream(&request(&p)).collect().await;
        assert_eq!(first.len(), 1);
        assert!(first[0].is_err());

        let second: Vec<String> = g
            .stream(&request(&p))
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(second.concat(), "The body text.");
        assert_eq!(second.len(), 3);
    }

    #[tokio::test]
    async fn stall_produces_nothing() {
        let g = ScriptedGenerator::new()
            .with_section("Intro", "text")
            .stall(&section_needle("Intro"), 1);
        let mut s = g.stream(&request(&section_needle("Intro")));
        let next = tokio::time::timeout(Duration::from_millis(50), s.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn gate_holds_remaining_chunks() {
        let gate = Gate::new();
        let g = ScriptedGenerator::new()
            .with_section("Intro", "one two three")
            .gate(&section_needle("Intro"), 1, gate.clone());
        let mut s = g.stream(&request(&section_needle("Intro")));
        assert_eq!(s.next().await.unwrap().unwrap(), "one ");
        let blocked = tokio::time::timeout(Duration::from_millis(50), s.next()).await;
        assert!(blocked.is_err());
        gate.open();
        assert_eq!(s.next().await.unwrap().unwrap(), "two ");
    }

    #[tokio::test]
    async fn static_retriever_limits_and_fails() {
        let r = StaticRetriever::new(vec![passage("a", "x"), passage("b", "y")]);
        assert_eq!(r.retrieve("q", 1).await.unwrap().len(), 1);
        assert_eq!(r.queries(), vec!["q".to_string()]);
        assert!(StaticRetriever::failing().retrieve("q", 3).await.is_err());
    }
}
