//! Local retrieval adapters.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::trait_def::{Passage, Retriever};

/// Retriever that never returns anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetrieval;

#[async_trait]
impl Retriever for NoRetrieval {
    async fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<Passage>> {
        Ok(Vec::new())
    }
}

/// Ranks an in-memory passage list by query term overlap.
#[derive(Debug, Clone, Default)]
pub struct KeywordRetriever {
    /// (source, text, lowercase terms)
    entries: Vec<(String, String, HashSet<String>)>,
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

impl KeywordRetriever {
    pub fn new<I, S, T>(passages: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let entries = passages
            .into_iter()
            .map(|(source, text)| {
                let text = text.into();
                let t = terms(&text);
                (source.into(), text, t)
            })
            .collect();
        Self { entries }
    }

    /// Load every `.md` and `.txt` file in `dir` as one passage, named by
    /// file name.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut passages = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read reference directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let is_text = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("md" | "txt")
            );
            if !is_text {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            passages.push((source, text));
        }
        passages.sort_by(|a, b| a.0.cmp(&b.0));
        tracing::debug!(dir = %dir.display(), count = passages.len(), "loaded reference passages");
        Ok(Self::new(passages))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Passage>> {
        let query_terms = terms(query);
        if query_terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut ranked: Vec<Passage> = self
            .entries
            .iter()
            .filter_map(|(source, text, passage_terms)| {
                let hits = query_terms.intersection(passage_terms).count();
                (hits > 0).then(|| Passage {
                    source: source.clone(),
                    text: text.clone(),
                    score: hits as f64 / query_terms.len() as f64,
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source.cmp(&b.source))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}
