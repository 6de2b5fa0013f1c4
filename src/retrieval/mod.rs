// Retrieval module
// Query embedding with caching, filtered similarity search, metrics and context assembly


pub mod cache;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embeddings::Embedder;
use crate::index::{DocumentRecord, Filters, IndexStore};
use crate::{RagError, Result};

pub use cache::QueryCache;

/// Candidates fetched per requested result when filters are applied
const FILTER_OVERFETCH: usize = 3;
/// Largest result count a single request may ask for
pub const MAX_RESULTS: usize = 20;
const METRICS_QUERY_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Results returned when a request does not say
    pub k: usize,
    /// Characters of chunk content kept per result
    pub max_context_chars: usize,
    pub cache_capacity: usize,
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    #[inline]
    fn default() -> Self {
        Self {
            k: 4,
            max_context_chars: 3000,
            cache_capacity: 1000,
            min_score: 0.0,
        }
    }
}

/// Per-query options; unset fields fall back to [`RetrievalConfig`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalRequest {
    pub k: Option<usize>,
    pub filters: Filters,
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub score: f32,
    /// Chunk content, truncated to the configured context length
    pub content: String,
    pub metadata: DocumentRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalMetrics {
    /// First 100 characters of the query
    pub query: String,
    pub num_results: usize,
    pub top_score: f32,
    pub avg_score: f32,
    pub retrieval_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// 1-based position in the context block
    pub index: usize,
    pub document_id: String,
    pub filename: String,
    /// `"<chunk number>/<total chunks>"`
    pub chunk: String,
    pub score: f64,
}

/// Semantic search over an [`IndexStore`] with a query-embedding cache
#[derive(Debug)]
pub struct Retriever {
    config: RetrievalConfig,
    embedder: Arc<Embedder>,
    cache: Mutex<QueryCache>,
    metrics: Mutex<Vec<RetrievalMetrics>>,
}

impl Retriever {
    #[inline]
    pub fn new(config: RetrievalConfig, embedder: Arc<Embedder>) -> Self {
        let cache = QueryCache::new(config.cache_capacity);
        Self {
            config,
            embedder,
            cache: Mutex::new(cache),
            metrics: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Find the chunks most similar to `query` that pass the request filters,
    /// best first. An index that is not ready yields no results.
    #[inline]
    pub fn retrieve(
        &self,
        store: &IndexStore,
        query: &str,
        request: &RetrievalRequest,
    ) -> Result<Vec<RetrievalResult>> {
        let k = request.k.unwrap_or(self.config.k);
        if !(1..=MAX_RESULTS).contains(&k) {
            return Err(RagError::Validation(format!(
                "Number of results must be between 1 and {} (got {})",
                MAX_RESULTS, k
            )));
        }
        let min_score = request.min_score.unwrap_or(self.config.min_score);
        let start_time = Instant::now();

        if !store.is_ready() {
            warn!("Index not ready - returning empty results");
            return Ok(Vec::new());
        }

        let query_embedding = self.embed_query(query)?;

        let candidates = if request.filters.is_empty() {
            k
        } else {
            k * FILTER_OVERFETCH
        };
        let search_k = candidates.min(store.document_count());
        let neighbors = store.search(&query_embedding, search_k)?;

        let mut results = Vec::with_capacity(k);
        for neighbor in neighbors {
            let Some(record) = neighbor.row.and_then(|row| store.record(row)) else {
                continue;
            };

            if neighbor.score < min_score || !record.matches(&request.filters) {
                continue;
            }

            results.push(RetrievalResult {
                score: neighbor.score,
                content: record
                    .content
                    .chars()
                    .take(self.config.max_context_chars)
                    .collect(),
                metadata: record.clone(),
            });

            if results.len() >= k {
                break;
            }
        }

        let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
        let metrics = RetrievalMetrics {
            query: query.chars().take(METRICS_QUERY_CHARS).collect(),
            num_results: results.len(),
            top_score: results.first().map_or(0.0, |r| r.score),
            avg_score: if results.is_empty() {
                0.0
            } else {
                results.iter().map(|r| r.score).sum::<f32>() / results.len() as f32
            },
            retrieval_time_ms: elapsed_ms,
            timestamp: Utc::now(),
        };

        info!(
            "Retrieved {} results in {:.1}ms (top score: {:.3})",
            metrics.num_results, elapsed_ms, metrics.top_score
        );
        lock(&self.metrics).push(metrics);

        Ok(results)
    }

    /// Embed a query, reusing the cached vector for a repeated query
    #[inline]
    pub fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let cached = lock(&self.cache).get(query).map(<[f32]>::to_vec);
        if let Some(embedding) = cached {
            debug!("Query cache hit");
            return Ok(embedding);
        }

        let embedding = self.embedder.embed_one(query)?;
        lock(&self.cache).insert(query, embedding.clone());
        Ok(embedding)
    }

    #[inline]
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
        info!("Query cache cleared");
    }

    #[inline]
    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Snapshot of every retrieval recorded so far, oldest first
    #[inline]
    pub fn metrics(&self) -> Vec<RetrievalMetrics> {
        lock(&self.metrics).clone()
    }
}

// Cache and metrics stay usable after a panicking holder
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Format results as numbered context blocks for the language model
#[inline]
pub fn build_context_block(results: &[RetrievalResult], include_scores: bool) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let number = i + 1;
            let filename = &result.metadata.filename;
            if include_scores {
                format!(
                    "[{}] Document: {} (relevance: {:.2})\n{}",
                    number, filename, result.score, result.content
                )
            } else {
                format!("[{}] Document: {}\n{}", number, filename, result.content)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// One citation per result, numbered to match [`build_context_block`]
#[inline]
pub fn citations(results: &[RetrievalResult]) -> Vec<Citation> {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| Citation {
            index: i + 1,
            document_id: result.metadata.document_id.clone(),
            filename: result.metadata.filename.clone(),
            chunk: format!(
                "{}/{}",
                result.metadata.chunk_idx + 1,
                result.metadata.total_chunks
            ),
            score: (f64::from(result.score) * 1000.0).round() / 1000.0,
        })
        .collect()
}
