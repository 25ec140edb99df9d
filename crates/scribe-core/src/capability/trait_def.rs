//! The `Generator` and `Retriever` traits.
//!
//! Both are object-safe so the coordinator can hold them as
//! `Arc<dyn Generator>` / `Arc<dyn Retriever>` and share one instance
//! across concurrent sessions.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

/// One call to the generation capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Fully assembled prompt, context included.
    pub prompt: String,
    /// Requested output size; already admitted by the budget guard.
    pub max_output_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_output_tokens,
        }
    }
}

/// Lazily produced text chunks. Finite; dropping it cancels the call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Raw text generation, e.g. a model behind a CLI or an HTTP API.
///
/// Treated as opaque and possibly failing or slow. Callers bound every
/// call with a timeout and never assume the output respects
/// `max_output_tokens`.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable name for logs (e.g. "command:claude").
    fn name(&self) -> &str;

    /// Single-shot generation.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Streaming generation. The stream ends after the last chunk; an
    /// `Err` item means the call failed and no further items follow.
    fn stream(&self, request: &GenerationRequest) -> ChunkStream;
}

// Compile-time assertion: Generator must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Generator) {}
};

/// A ranked reference passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Where the passage came from (file name, URL, ...).
    pub source: String,
    pub text: String,
    /// Relevance; higher is better. Only the order matters to the pipeline.
    pub score: f64,
}

/// Read-only access to reference knowledge.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `limit` passages relevant to `query`, best first.
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Passage>>;
}

// Compile-time assertion: Retriever must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Retriever) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct EchoGenerator;

    #[async_trait]
    impl Generator for EchoGenerator {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            Ok(request.prompt.clone())
        }

        fn stream(&self, request: &GenerationRequest) -> ChunkStream {
            let words: Vec<Result<String>> = request
                .prompt
                .split_inclusive(' ')
                .map(|w| Ok(w.to_string()))
                .collect();
            Box::pin(futures::stream::iter(words))
        }
    }

    #[test]
    fn generator_is_object_safe() {
        let generator: Box<dyn Generator> = Box::new(EchoGenerator);
        assert_eq!(generator.name(), "echo");
    }

    #[tokio::test]
    async fn stream_and_generate_agree() {
        let generator: std::sync::Arc<dyn Generator> = std::sync::Arc::new(EchoGenerator);
        let request = GenerationRequest::new("one two three", 10);
        let whole = generator.generate(&request).await.unwrap();
        let chunks: Vec<String> = generator
            .stream(&request)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), whole);
    }
}
