//! Hybrid retrieval: lexical prune, dense re-scoring, TTL'd ephemeral docs.
//!
//! Two-stage ranking keeps the dense pass bounded: a cheap lexical score
//! prunes the corpus to `top_k * candidate_multiplier` candidates, then
//! dense similarity re-scores only those. The final score is a convex
//! combination of both components with policy-configured weights.
//!
//! If the embedding backend is unavailable the retriever degrades to
//! lexical-only scoring and flags the result set instead of failing the
//! turn.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;

/// Embedding backend failure. Non-fatal: triggers lexical-only degradation.
#[derive(Debug, Clone, Error)]
#[error("embedding backend unavailable: {detail}")]
pub struct EmbeddingError {
    pub detail: String,
}

/// Produces dense vectors for similarity scoring.
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Deterministic hashing embedder.
///
/// Buckets token counts by hash and L2-normalizes. A stand-in for a
/// provider-backed embedding service with the same interface.
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dimension: 64 }
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingBackend for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            let index = (hasher.finish() as usize) % self.dimension;
            vector[index] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// A knowledge base entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier within the store
    pub source_id: String,

    /// Document text
    pub text: String,

    /// Where the document came from (e.g. "kb", "tool:search_files")
    pub provenance_tag: String,
}

impl Document {
    pub fn new(
        source_id: impl Into<String>,
        text: impl Into<String>,
        provenance_tag: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
            provenance_tag: provenance_tag.into(),
        }
    }
}

/// Score components behind a combined score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub lexical: f64,
    pub vector: f64,
}

/// A scored document returned from retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub source_id: String,
    pub text: String,
    pub score: f64,
    pub provenance_tag: String,
    pub breakdown: ScoreBreakdown,
}

/// Ordered result set, highest score first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalSet {
    pub matches: Vec<RetrievedDocument>,

    /// True when scoring fell back to lexical-only
    pub degraded: bool,
}

struct StoredDoc {
    doc: Document,
    vector: Option<Vec<f32>>,
    expires_at: Option<DateTime<Utc>>,
}

/// Hybrid retriever over an in-process document store.
pub struct Retriever {
    embedder: Arc<dyn EmbeddingBackend>,
    config: RetrievalConfig,
    docs: RwLock<HashMap<String, StoredDoc>>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn EmbeddingBackend>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            config,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace durable documents.
    pub fn ingest(&self, documents: Vec<Document>) {
        let mut docs = self.docs.write().expect("retriever lock poisoned");
        for doc in documents {
            let vector = match self.embedder.embed(&doc.text) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(source_id = %doc.source_id, error = %e, "Embedding failed at ingest");
                    None
                }
            };
            docs.insert(
                doc.source_id.clone(),
                StoredDoc {
                    doc,
                    vector,
                    expires_at: None,
                },
            );
        }
    }

    /// Insert an ephemeral document that expires after `ttl`.
    ///
    /// Expired ephemeral documents are excluded from every result set; no
    /// caller-side filtering is needed.
    pub fn ingest_ephemeral(&self, document: Document, ttl: Duration) {
        let vector = self.embedder.embed(&document.text).ok();
        let mut docs = self.docs.write().expect("retriever lock poisoned");
        docs.insert(
            document.source_id.clone(),
            StoredDoc {
                doc: document,
                vector,
                expires_at: Some(Utc::now() + ttl),
            },
        );
    }

    /// Number of live documents in the store.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.docs
            .read()
            .expect("retriever lock poisoned")
            .values()
            .filter(|d| d.expires_at.map(|e| now < e).unwrap_or(true))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch documents ordered by combined score, highest first.
    pub fn retrieve(&self, query: &str, top_k: Option<usize>) -> RetrievalSet {
        let top_k = top_k.unwrap_or(self.config.top_k);
        let now = Utc::now();

        // Purge expired ephemerals while collecting live candidates.
        let live: Vec<(Document, Option<Vec<f32>>)> = {
            let mut docs = self.docs.write().expect("retriever lock poisoned");
            docs.retain(|_, d| d.expires_at.map(|e| now < e).unwrap_or(true));
            docs.values()
                .map(|d| (d.doc.clone(), d.vector.clone()))
                .collect()
        };

        if live.is_empty() {
            return RetrievalSet::default();
        }

        let query_tokens = token_counts(query);

        // Stage one: lexical prune to a bounded candidate set.
        let mut candidates: Vec<(Document, Option<Vec<f32>>, f64)> = live
            .into_iter()
            .map(|(doc, vector)| {
                let lexical = lexical_score(&query_tokens, &doc.text);
                (doc, vector, lexical)
            })
            .collect();
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_k * self.config.candidate_multiplier.max(1));

        // Stage two: dense re-scoring over the pruned set.
        let query_vec = match self.embedder.embed(query) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Embedding backend unavailable, lexical-only scoring");
                None
            }
        };
        let degraded = query_vec.is_none();

        let mut matches: Vec<RetrievedDocument> = candidates
            .into_iter()
            .filter_map(|(doc, vector, lexical)| {
                let dense = match (&query_vec, &vector) {
                    (Some(q), Some(v)) => dot(q, v) as f64,
                    _ => 0.0,
                };
                let score = if degraded {
                    lexical
                } else {
                    self.config.combined_score(lexical, dense)
                };
                if score < self.config.min_score {
                    return None;
                }
                Some(RetrievedDocument {
                    source_id: doc.source_id,
                    text: doc.text,
                    score,
                    provenance_tag: doc.provenance_tag,
                    breakdown: ScoreBreakdown {
                        lexical,
                        vector: dense,
                    },
                })
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);

        debug!(query_len = query.len(), results = matches.len(), degraded, "Retrieval complete");
        RetrievalSet { matches, degraded }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn token_counts(text: &str) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_insert(0) += 1;
    }
    counts
}

/// Multiset Jaccard overlap between query tokens and document tokens.
fn lexical_score(query_tokens: &HashMap<String, u32>, content: &str) -> f64 {
    let doc_tokens = token_counts(content);

    let intersection: u32 = query_tokens
        .iter()
        .map(|(token, count)| (*count).min(*doc_tokens.get(token).unwrap_or(&0)))
        .sum();
    let union: u32 = query_tokens.values().sum::<u32>() + doc_tokens.values().sum::<u32>()
        - intersection;

    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenEmbedder;

    impl EmbeddingBackend for BrokenEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError {
                detail: "backend offline".to_string(),
            })
        }
    }

    fn retriever() -> Retriever {
        Retriever::new(Arc::new(HashEmbedder::default()), RetrievalConfig::default())
    }

    #[test]
    fn test_relevant_document_ranks_first() {
        let r = retriever();
        r.ingest(vec![
            Document::new("battery", "battery life lasts eight hours on a charge", "kb"),
            Document::new("wifi", "wifi setup requires the companion app", "kb"),
            Document::new("warranty", "the warranty covers two years of defects", "kb"),
        ]);

        let result = r.retrieve("how long does the battery life last", None);
        assert!(!result.degraded);
        assert!(!result.matches.is_empty());
        assert_eq!(result.matches[0].source_id, "battery");
    }

    #[test]
    fn test_expired_ephemeral_excluded() {
        let r = retriever();
        r.ingest_ephemeral(
            Document::new("stale", "battery status from a tool call", "tool:status"),
            Duration::milliseconds(-10),
        );
        r.ingest_ephemeral(
            Document::new("fresh", "battery status from a newer tool call", "tool:status"),
            Duration::seconds(60),
        );

        let result = r.retrieve("battery status", None);
        let ids: Vec<&str> = result.matches.iter().map(|m| m.source_id.as_str()).collect();
        assert!(ids.contains(&"fresh"));
        assert!(!ids.contains(&"stale"));
    }

    #[test]
    fn test_expired_ephemeral_purged_from_store() {
        let r = retriever();
        r.ingest_ephemeral(
            Document::new("stale", "short lived", "tool:status"),
            Duration::milliseconds(-10),
        );

        assert_eq!(r.len(), 0);
        r.retrieve("anything", None);
        assert!(r.is_empty());
    }

    #[test]
    fn test_degraded_mode_is_flagged_not_fatal() {
        let r = Retriever::new(Arc::new(BrokenEmbedder), RetrievalConfig::default());
        // Ingest succeeds even with a broken embedder (vector stored as None)
        r.ingest(vec![Document::new(
            "doc",
            "battery life lasts eight hours",
            "kb",
        )]);

        let result = r.retrieve("battery life", None);
        assert!(result.degraded);
        assert!(!result.matches.is_empty());
        assert!(result.matches[0].breakdown.vector == 0.0);
    }

    #[test]
    fn test_min_score_filters_noise() {
        // Lexical-only weights keep the threshold independent of hash
        // bucket collisions in the embedder.
        let r = Retriever::new(
            Arc::new(HashEmbedder::default()),
            RetrievalConfig {
                lexical_weight: 1.0,
                vector_weight: 0.0,
                ..Default::default()
            },
        );
        r.ingest(vec![Document::new(
            "unrelated",
            "completely different topic about gardening tulips",
            "kb",
        )]);

        let result = r.retrieve("quantum flux capacitor calibration", None);
        assert!(result.matches.is_empty());
    }

    #[test]
    fn test_top_k_bounds_results() {
        let r = retriever();
        let docs: Vec<Document> = (0..10)
            .map(|i| Document::new(format!("d{}", i), "battery battery battery", "kb"))
            .collect();
        r.ingest(docs);

        let result = r.retrieve("battery", Some(3));
        assert_eq!(result.matches.len(), 3);
    }

    #[test]
    fn test_lexical_score_overlap() {
        let query = token_counts("battery life");
        let full = lexical_score(&query, "battery life");
        let partial = lexical_score(&query, "battery charger cable");
        let none = lexical_score(&query, "wifi setup guide");

        assert!(full > partial);
        assert!(partial > none);
        assert_eq!(none, 0.0);
    }
}
