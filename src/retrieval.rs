//! Source retrieval.
//!
//! The pipeline asks a [`Retriever`] a fixed set of persona queries and
//! concatenates what comes back into the source context every prompt is
//! grounded in. [`LocalCorpus`] is a keyword-overlap retriever over a JSON
//! file of documents, enough to run the CLI without a search backend.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::truncate_chars;

/// Upper bound of the source context handed to the model.
pub const MAX_CONTEXT_CHARS: usize = 24_000;

const MAX_RESULTS: usize = 5;
const MAX_SNIPPETS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippets: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Search backend used during one run. Closed by the orchestrator when the run
/// ends, whatever the outcome.
pub trait Retriever {
    fn search(
        &self,
        query: &str,
        exclude_urls: &[String],
    ) -> impl Future<Output = Result<Vec<SearchResult>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// One query per reader of the report: the company itself, its people, its
/// market, its trajectory and the candidate preparing for `topic`.
pub fn persona_queries(company: &str, topic: &str) -> Vec<String> {
    vec![
        format!("{company} company overview business model products"),
        format!("{company} culture values employees work style"),
        format!("{company} market position competitors"),
        format!("{company} growth opportunities risks news"),
        format!("{company} {topic} interview"),
    ]
}

/// Renders results as numbered blocks, bounded by [`MAX_CONTEXT_CHARS`].
pub fn build_context(results: &[SearchResult]) -> String {
    let mut context = String::new();
    for (idx, result) in results.iter().enumerate() {
        context.push_str(&format!("[{}] {} ({})\n", idx + 1, result.title, result.url));
        if !result.description.trim().is_empty() {
            context.push_str(result.description.trim());
            context.push('\n');
        }
        for snippet in &result.snippets {
            context.push_str("- ");
            context.push_str(snippet.trim());
            context.push('\n');
        }
        context.push('\n');
    }
    truncate_chars(&mut context, MAX_CONTEXT_CHARS);
    context.trim_end().to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct Document {
    url: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    text: String,
}

/// Documents loaded from a JSON array of `{url, title, description, text}`.
#[derive(Debug)]
pub struct LocalCorpus {
    documents: Vec<Document>,
    closed: bool,
}

impl LocalCorpus {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sources from {}", path.display()))?;
        let documents: Vec<Document> = serde_json::from_str(&contents)
            .with_context(|| format!("invalid sources file {}", path.display()))?;
        debug!(documents = documents.len(), path = %path.display(), "loaded local corpus");
        Ok(Self {
            documents,
            closed: false,
        })
    }

    fn rank(&self, query: &str, exclude_urls: &[String]) -> Vec<SearchResult> {
        let terms = terms(query);
        let mut scored: Vec<(usize, &Document)> = self
            .documents
            .iter()
            .filter(|doc| !exclude_urls.contains(&doc.url))
            .filter_map(|doc| {
                let haystack = terms_of(&[&doc.title, &doc.description, &doc.text]);
                let score = terms.intersection(&haystack).count();
                (score > 0).then_some((score, doc))
            })
            .collect();
        // Stable sort keeps file order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        scored
            .into_iter()
            .take(MAX_RESULTS)
            .map(|(_, doc)| SearchResult {
                url: doc.url.clone(),
                title: doc.title.clone(),
                snippets: snippets(&doc.text, &terms),
                description: doc.description.clone(),
            })
            .collect()
    }
}

impl Retriever for LocalCorpus {
    async fn search(&self, query: &str, exclude_urls: &[String]) -> Result<Vec<SearchResult>> {
        if self.closed {
            bail!("local corpus is closed");
        }
        Ok(self.rank(query, exclude_urls))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Lowercase words of at least three characters.
fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

fn terms_of(parts: &[&str]) -> BTreeSet<String> {
    parts.iter().flat_map(|part| terms(part)).collect()
}

/// Sentences of `text` that mention any query term.
fn snippets(text: &str, query_terms: &BTreeSet<String>) -> Vec<String> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .filter(|sentence| !terms(sentence).is_disjoint(query_terms))
        .take(MAX_SNIPPETS)
        .map(str::to_string)
        .collect()
}
