//! Reorders retrieval candidates by pairwise relevance to the query, caching scores
//! so a repeated query against a stable candidate set skips re-scoring entirely.
//!
//! Final score blends the cross-encoder score with the retriever's fused score
//! (`0.6*rerank + 0.4*fused`) so an unavailable or low-confidence cross-encoder can't
//! fully override retrieval. Ties break on `fused`, then on `chunk_id` for determinism.
//! When the scorer is unavailable the candidates pass through unchanged — reranking is
//! an enhancement, never a hard dependency of the query path.

pub mod scorer;

use std::sync::Arc;
use std::time::Duration;

use cache::{collection_tag, TypedCache};
use chunk_model::RetrievalCandidate;

pub use scorer::{CrossEncoder, OnnxCrossEncoder, OnnxCrossEncoderConfig, RerankerError};

const SCORE_BATCH_SIZE: usize = 16;

fn cache_key(query_fingerprint: &str, chunk_id: &str) -> String {
    format!("{query_fingerprint}:{chunk_id}")
}

/// Cross-encoder reranking stage with a shared rerank-score cache.
pub struct Reranker {
    scorer: Option<Arc<dyn CrossEncoder>>,
    cache: TypedCache<f32>,
}

impl Reranker {
    pub fn new(scorer: Option<Arc<dyn CrossEncoder>>, cache: TypedCache<f32>) -> Self {
        Self { scorer, cache }
    }

    /// Reorder `candidates` by blended score and truncate to `rerank_k`.
    ///
    /// `query_fingerprint` identifies the `(query, collection, filters)` tuple for
    /// cache keys; `collection` tags cache writes for later bulk invalidation.
    pub async fn rerank(
        &self,
        query: &str,
        query_fingerprint: &str,
        collection: &str,
        mut candidates: Vec<RetrievalCandidate>,
        rerank_k: usize,
        ttl: Option<Duration>,
    ) -> Vec<RetrievalCandidate> {
        let Some(scorer) = self.scorer.as_ref() else {
            tracing::debug!("reranker unavailable, passing candidates through unchanged");
            candidates.truncate(rerank_k);
            return candidates;
        };

        let mut scores = vec![None; candidates.len()];
        let mut misses = Vec::new();
        for (idx, candidate) in candidates.iter().enumerate() {
            let key = cache_key(query_fingerprint, &candidate.chunk_id.0);
            match self.cache.get(&key).await {
                Some(score) => scores[idx] = Some(score),
                None => misses.push(idx),
            }
        }

        for batch in misses.chunks(SCORE_BATCH_SIZE) {
            let docs: Vec<&str> = batch.iter().map(|&i| candidates[i].text.as_str()).collect();
            match scorer.score_batch(query, &docs) {
                Ok(batch_scores) => {
                    let tag = collection_tag(collection);
                    for (&idx, score) in batch.iter().zip(batch_scores.into_iter()) {
                        scores[idx] = Some(score);
                        let key = cache_key(query_fingerprint, &candidates[idx].chunk_id.0);
                        self.cache.set(key, score, tag.clone(), ttl).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "reranker scoring failed, passing candidates through unchanged");
                    candidates.truncate(rerank_k);
                    return candidates;
                }
            }
        }

        // Blended score is a sort key only: `fused_score` on each candidate must
        // survive untouched, since the answerer reads it back as `top_fused` for the
        // confidence formula.
        let blended: Vec<f32> =
            candidates.iter().enumerate().map(|(idx, c)| 0.6 * scores[idx].unwrap_or(0.0) + 0.4 * c.fused_score).collect();

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| {
            blended[a]
                .partial_cmp(&blended[b])
                .unwrap_or(std::cmp::Ordering::Equal)
                .reverse()
                .then_with(|| {
                    candidates[b]
                        .fused_score
                        .partial_cmp(&candidates[a].fused_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| candidates[a].chunk_id.0.cmp(&candidates[b].chunk_id.0))
        });
        order.truncate(rerank_k);

        let mut slots: Vec<Option<RetrievalCandidate>> = candidates.into_iter().map(Some).collect();
        order.into_iter().map(|idx| slots[idx].take().expect("each index selected once")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_model::{ChunkId, ChunkMetadata};
    use std::time::Duration;

    struct FixedScorer(f32);

    impl CrossEncoder for FixedScorer {
        fn score_batch(&self, _query: &str, documents: &[&str]) -> Result<Vec<f32>, RerankerError> {
            Ok(vec![self.0; documents.len()])
        }
    }

    struct FailingScorer;

    impl CrossEncoder for FailingScorer {
        fn score_batch(&self, _query: &str, _documents: &[&str]) -> Result<Vec<f32>, RerankerError> {
            Err(RerankerError::ProviderFailure { message: "down".into() })
        }
    }

    fn candidate(id: &str, fused: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: ChunkId(id.to_string()),
            text: format!("text for {id}"),
            metadata: ChunkMetadata {
                source: "doc.md".into(),
                doc_title: "Doc".into(),
                section_title: "Intro".into(),
                page: None,
            },
            dense_score: Some(0.5),
            lexical_score: Some(0.5),
            fused_score: fused,
        }
    }

    #[tokio::test]
    async fn missing_scorer_passes_through_truncated() {
        let cache: TypedCache<f32> = TypedCache::new("rerank", Duration::from_secs(60), 100);
        let reranker = Reranker::new(None, cache);
        let candidates = vec![candidate("a", 0.9), candidate("b", 0.5), candidate("c", 0.3)];
        let out = reranker.rerank("q", "fp", "col", candidates, 2, None).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id.0, "a");
    }

    #[tokio::test]
    async fn scorer_failure_falls_back_to_pass_through() {
        let cache: TypedCache<f32> = TypedCache::new("rerank", Duration::from_secs(60), 100);
        let reranker = Reranker::new(Some(Arc::new(FailingScorer)), cache);
        let candidates = vec![candidate("a", 0.9), candidate("b", 0.5)];
        let out = reranker.rerank("q", "fp", "col", candidates, 2, None).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id.0, "a");
    }

    #[tokio::test]
    async fn ties_break_by_chunk_id() {
        let cache: TypedCache<f32> = TypedCache::new("rerank", Duration::from_secs(60), 100);
        let reranker = Reranker::new(Some(Arc::new(FixedScorer(0.5))), cache);
        // identical fused scores -> rerank blend is identical -> tie broken by chunk_id.
        let candidates = vec![candidate("z", 0.5), candidate("a", 0.5), candidate("m", 0.5)];
        let out = reranker.rerank("q", "fp", "col", candidates, 3, None).await;
        assert_eq!(out.iter().map(|c| c.chunk_id.0.clone()).collect::<Vec<_>>(), vec!["a", "m", "z"]);
    }

    #[tokio::test]
    async fn ties_break_by_original_fused_before_chunk_id() {
        let cache: TypedCache<f32> = TypedCache::new("rerank", Duration::from_secs(60), 100);
        struct ScorerByDoc;
        impl CrossEncoder for ScorerByDoc {
            fn score_batch(&self, _query: &str, documents: &[&str]) -> Result<Vec<f32>, RerankerError> {
                Ok(documents.iter().map(|d| if d.contains("for z") { 0.5 } else { 0.633_333_3 }).collect())
            }
        }
        let reranker = Reranker::new(Some(Arc::new(ScorerByDoc)), cache);
        // "z" blends to 0.6*0.5+0.4*0.5=0.5; "a" blends to 0.6*0.6333+0.4*0.3=0.5 too.
        // chunk_id order alone would put "a" first; the correct tie-break keeps the
        // higher original fused score ("z", 0.5) ahead of ("a", 0.3).
        let candidates = vec![candidate("a", 0.3), candidate("z", 0.5)];
        let out = reranker.rerank("q", "fp", "col", candidates, 2, None).await;
        assert_eq!(out.iter().map(|c| c.chunk_id.0.clone()).collect::<Vec<_>>(), vec!["z", "a"]);
        // original fused_score must survive the blend, not be overwritten by it.
        assert_eq!(out[0].fused_score, 0.5);
        assert_eq!(out[1].fused_score, 0.3);
    }

    #[tokio::test]
    async fn second_call_hits_cache_not_scorer() {
        let cache: TypedCache<f32> = TypedCache::new("rerank", Duration::from_secs(60), 100);
        let reranker = Reranker::new(Some(Arc::new(FixedScorer(0.9))), cache);
        let candidates = vec![candidate("a", 0.1)];
        let first = reranker.rerank("q", "fp", "col", candidates.clone(), 1, None).await;
        let second = reranker.rerank("q", "fp", "col", candidates, 1, None).await;
        assert_eq!(first[0].fused_score, second[0].fused_score);
    }
}
