//! The two-stage query engine: brute-force cosine retrieval over the active
//! collection, optionally refined by an external reranker.
//!
//! There is no index; the design is an intentional linear scan. Scoring is
//! spread across threads but ordering stays deterministic: similarity
//! descending, ties broken by insertion order.

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    error::Result,
    providers::{ProviderRegistry, Reranker},
    store::{Entry, Modality, VectorStore},
};

/// Cosine candidates fetched per requested result before reranking.
const RERANK_POOL_MULTIPLIER: usize = 3;

/// L2 norm: `sqrt(Σ vᵢ²)`.
pub fn normalize(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Cosine similarity `dot(a, b) / (|a| · |b|)` with precomputed magnitudes.
///
/// Defined as 0.0 when either magnitude is zero: a direction-less vector is
/// similar to nothing, and the alternative is a division by zero.
pub fn cosine_similarity(
    a: &[f32],
    b: &[f32],
    mag_a: f32,
    mag_b: f32,
) -> f32 {
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (mag_a * mag_b)
}

/// A query: either a pre-embedded vector or text to embed first.
#[derive(Debug, Clone)]
pub enum FindQuery {
    Vector(Vec<f32>),
    Text(String),
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub entry: Entry,
    pub similarity: f32,
}

/// Find the `top_k` entries most similar to the query.
///
/// Text queries are resolved to a vector via the text embedding provider and
/// compared only against text-modality entries; raw-vector queries carry no
/// modality tag, so they fall back to comparing against entries of the same
/// vector length. Either way, entries the query cannot be meaningfully
/// compared against are invisible to it.
///
/// When a reranker is supplied and the query originated as text, the top
/// `3 × top_k` cosine candidates are rescored as `(query_text, content)`
/// pairs; a candidate whose scoring fails keeps its cosine score rather than
/// failing the whole query.
pub async fn find(
    store: &VectorStore,
    providers: &ProviderRegistry,
    reranker: Option<&dyn Reranker>,
    query: FindQuery,
    top_k: usize,
    rerank_max_chars: usize,
) -> Result<Vec<Match>> {
    let (vector, query_text) = match query {
        FindQuery::Vector(v) => (v, None),
        FindQuery::Text(text) => {
            let v = providers.embed(&text, Modality::Text).await?;
            (v, Some(text))
        }
    };

    let query_modality = query_text.as_ref().map(|_| Modality::Text);
    let query_magnitude = normalize(&vector);

    let rerank_active = reranker.is_some() && query_text.is_some();
    let pool = if rerank_active {
        top_k.saturating_mul(RERANK_POOL_MULTIPLIER)
    } else {
        top_k
    };

    let mut candidates = store.with_active(|entries| {
        let mut scored: Vec<(usize, f32)> = entries
            .par_iter()
            .enumerate()
            .filter(|(_, entry)| match query_modality {
                Some(modality) => entry.meta.modality == modality,
                None => entry.vector.len() == vector.len(),
            })
            .filter(|(_, entry)| entry.vector.len() == vector.len())
            .map(|(i, entry)| {
                let similarity = cosine_similarity(
                    &vector,
                    &entry.vector,
                    query_magnitude,
                    entry.magnitude,
                );
                (i, similarity)
            })
            .collect();

        sort_scored(&mut scored);
        scored
            .into_iter()
            .take(pool)
            .map(|(i, similarity)| Match {
                entry: entries[i].clone(),
                similarity,
            })
            .collect::<Vec<_>>()
    })?;

    if let (Some(reranker), Some(query_text)) = (reranker, &query_text)
        && !candidates.is_empty()
    {
        rescore(reranker, query_text, &mut candidates, rerank_max_chars)
            .await;
        candidates.truncate(top_k);
    }

    Ok(candidates)
}

/// Sort by similarity descending, insertion order ascending on ties.
fn sort_scored(scored: &mut [(usize, f32)]) {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
}

/// Replace each candidate's cosine score with the reranker's relevance score,
/// keeping the cosine score for any candidate whose scoring fails, then
/// re-sort. Per-candidate fault isolation: one bad candidate never fails the
/// query.
async fn rescore(
    reranker: &dyn Reranker,
    query_text: &str,
    candidates: &mut [Match],
    max_chars: usize,
) {
    for candidate in candidates.iter_mut() {
        let Some(content) = candidate.entry.meta.content.as_deref() else {
            continue;
        };
        let content = truncate_chars(content, max_chars);

        match reranker.score(query_text, content).await {
            Ok(relevance) => candidate.similarity = relevance,
            Err(err) => {
                tracing::warn!(
                    id = %candidate.entry.id,
                    error = %err,
                    "rerank scoring failed, keeping cosine score"
                );
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Truncate to at most `max_chars` characters on a char boundary.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::Error,
        providers::EmbeddingProvider,
        store::{EntryDraft, EntryMeta},
    };

    /// Maps known strings to fixed vectors.
    struct TableEmbedder(Vec<(&'static str, Vec<f32>)>);

    #[async_trait]
    impl EmbeddingProvider for TableEmbedder {
        async fn embed(
            &self,
            input: &str,
            _modality: Modality,
        ) -> Result<Vec<f32>> {
            self.0
                .iter()
                .find(|(text, _)| *text == input)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    Error::Embedding(format!("no fixture for {input:?}"))
                })
        }
    }

    /// Scores candidates from a fixed table; unknown content errors.
    struct TableReranker(Vec<(&'static str, f32)>);

    #[async_trait]
    impl Reranker for TableReranker {
        async fn score(&self, _query: &str, candidate: &str) -> Result<f32> {
            self.0
                .iter()
                .find(|(content, _)| *content == candidate)
                .map(|(_, score)| *score)
                .ok_or_else(|| Error::Rerank("no fixture".to_string()))
        }
    }

    fn registry(table: Vec<(&'static str, Vec<f32>)>) -> ProviderRegistry {
        ProviderRegistry::new(Box::new(|_| {
            Err(Error::Config("not configured".to_string()))
        }))
        .with_provider(Modality::Text, Arc::new(TableEmbedder(table)))
    }

    fn text_draft(vector: Vec<f32>, content: &str) -> EntryDraft {
        EntryDraft::new(
            vector,
            EntryMeta {
                content: Some(content.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn normalize_is_l2_norm() {
        assert!((normalize(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert_eq!(normalize(&[]), 0.0);
    }

    #[test]
    fn cosine_is_symmetric() {
        let a = [0.2, -0.7, 1.3];
        let b = [1.0, 0.4, -0.1];
        let (ma, mb) = (normalize(&a), normalize(&b));
        let ab = cosine_similarity(&a, &b, ma, mb);
        let ba = cosine_similarity(&b, &a, mb, ma);
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn cosine_self_similarity_is_one() {
        let a = [0.5, 2.0, -1.0];
        let m = normalize(&a);
        assert!((cosine_similarity(&a, &a, m, m) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_magnitude_is_zero() {
        let zero = [0.0, 0.0];
        let a = [1.0, 2.0];
        let m = normalize(&a);
        assert_eq!(cosine_similarity(&zero, &a, 0.0, m), 0.0);
        assert_eq!(cosine_similarity(&a, &zero, m, 0.0), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero, 0.0, 0.0), 0.0);
    }

    #[tokio::test]
    async fn exact_match_ranks_first_with_similarity_one() {
        let store = VectorStore::new("main");
        let vectors = [
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.6, 0.8, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![-1.0, 0.0, 0.0],
        ];
        for (i, v) in vectors.iter().enumerate() {
            store
                .insert_one(text_draft(v.clone(), &format!("doc {i}")))
                .unwrap();
        }

        let providers = registry(vec![]);
        let results = find(
            &store,
            &providers,
            None,
            FindQuery::Vector(vec![0.6, 0.8, 0.0]),
            3,
            0,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].entry.meta.content.as_deref(), Some("doc 2"));
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        for window in results.windows(2) {
            assert!(window[0].similarity >= window[1].similarity);
        }
    }

    #[tokio::test]
    async fn returns_at_most_top_k() {
        let store = VectorStore::new("main");
        for i in 0..10 {
            store
                .insert_one(text_draft(vec![1.0, i as f32], "x"))
                .unwrap();
        }

        let providers = registry(vec![]);
        let results = find(
            &store,
            &providers,
            None,
            FindQuery::Vector(vec![1.0, 0.0]),
            4,
            0,
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn ties_break_by_insertion_order() {
        let store = VectorStore::new("main");
        // Identical vectors: identical similarity for any query.
        let a = store.insert_one(text_draft(vec![1.0, 1.0], "a")).unwrap();
        let b = store.insert_one(text_draft(vec![1.0, 1.0], "b")).unwrap();
        let c = store.insert_one(text_draft(vec![1.0, 1.0], "c")).unwrap();

        let providers = registry(vec![]);
        let results = find(
            &store,
            &providers,
            None,
            FindQuery::Vector(vec![1.0, 1.0]),
            3,
            0,
        )
        .await
        .unwrap();

        let ids: Vec<_> = results.iter().map(|m| m.entry.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn vector_query_skips_mismatched_lengths() {
        let store = VectorStore::new("main");
        store.insert_one(text_draft(vec![1.0, 0.0], "2d")).unwrap();
        store
            .insert_one(text_draft(vec![1.0, 0.0, 0.0], "3d"))
            .unwrap();

        let providers = registry(vec![]);
        let results = find(
            &store,
            &providers,
            None,
            FindQuery::Vector(vec![1.0, 0.0]),
            10,
            0,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.meta.content.as_deref(), Some("2d"));
    }

    #[tokio::test]
    async fn text_query_filters_by_modality_tag() {
        let store = VectorStore::new("main");
        store.insert_one(text_draft(vec![1.0, 0.0], "text")).unwrap();
        store
            .insert_one(EntryDraft::new(
                vec![1.0, 0.0],
                EntryMeta {
                    content: Some("image".to_string()),
                    modality: Modality::Image,
                    ..Default::default()
                },
            ))
            .unwrap();

        let providers = registry(vec![("query", vec![1.0, 0.0])]);
        let results = find(
            &store,
            &providers,
            None,
            FindQuery::Text("query".to_string()),
            10,
            0,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.meta.content.as_deref(), Some("text"));
    }

    #[tokio::test]
    async fn reranker_reorders_candidates() {
        let store = VectorStore::new("main");
        // Cosine order for the query will be X, Y, Z.
        store.insert_one(text_draft(vec![1.0, 0.0], "X")).unwrap();
        store.insert_one(text_draft(vec![0.9, 0.1], "Y")).unwrap();
        store.insert_one(text_draft(vec![0.5, 0.5], "Z")).unwrap();

        let providers = registry(vec![("query", vec![1.0, 0.0])]);
        let reranker =
            TableReranker(vec![("X", 0.2), ("Y", 0.5), ("Z", 0.9)]);

        let results = find(
            &store,
            &providers,
            Some(&reranker),
            FindQuery::Text("query".to_string()),
            3,
            100,
        )
        .await
        .unwrap();

        let order: Vec<_> = results
            .iter()
            .map(|m| m.entry.meta.content.clone().unwrap())
            .collect();
        assert_eq!(order, vec!["Z", "Y", "X"]);
        assert!((results[0].similarity - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn rerank_failure_keeps_cosine_score() {
        let store = VectorStore::new("main");
        store.insert_one(text_draft(vec![1.0, 0.0], "X")).unwrap();
        store.insert_one(text_draft(vec![0.9, 0.1], "Y")).unwrap();

        let providers = registry(vec![("query", vec![1.0, 0.0])]);
        // Only Y has a rerank fixture; scoring X errors.
        let reranker = TableReranker(vec![("Y", 0.4)]);

        let results = find(
            &store,
            &providers,
            Some(&reranker),
            FindQuery::Text("query".to_string()),
            2,
            100,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        // X keeps cosine 1.0, Y gets relevance 0.4: X stays first.
        assert_eq!(results[0].entry.meta.content.as_deref(), Some("X"));
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert!((results[1].similarity - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn vector_query_never_reranks() {
        let store = VectorStore::new("main");
        store.insert_one(text_draft(vec![1.0, 0.0], "X")).unwrap();

        let providers = registry(vec![]);
        let reranker = TableReranker(vec![("X", 0.0)]);

        let results = find(
            &store,
            &providers,
            Some(&reranker),
            FindQuery::Vector(vec![1.0, 0.0]),
            1,
            100,
        )
        .await
        .unwrap();

        // Rerank requires a text query; the cosine score survives.
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
