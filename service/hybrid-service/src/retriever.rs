//! §4.10 Retriever: fan out to the dense and lexical backends concurrently, normalize
//! each side's scores independently, and fuse by the query plan's weights.
//!
//! Both backends are accessed through synchronous [`chunking_store`] traits (§4.4/§4.5
//! are adapter APIs, not async services), so "concurrent" here means two async blocks
//! each making a direct blocking call, joined with [`tokio::join!`] — the same idiom
//! [`reranker::Reranker::rerank`] uses for its own (sync) cross-encoder call.

use std::collections::HashMap;
use std::sync::Arc;

use chunk_model::{ChunkId, ChunkMetadata, CollectionName, QueryPlan, RetrievalCandidate};
use chunking_store::{ChunkStoreRead, SearchOptions, StoreError, TextSearcher, VectorSearcher};

#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    #[error("dense retrieval unavailable: {0}")]
    DenseUnavailable(StoreError),
}

/// Outcome of one `retrieve` call, including whether lexical retrieval degraded to
/// dense-only so the caller can tag the request span accordingly (§4.10's
/// `lexical="unavailable"` marker).
pub struct RetrievalOutcome {
    pub candidates: Vec<RetrievalCandidate>,
    pub lexical_unavailable: bool,
}

pub struct Retriever {
    chunks: Arc<dyn ChunkStoreRead + Send + Sync>,
    vector: Arc<dyn VectorSearcher + Send + Sync>,
    text: Arc<dyn TextSearcher + Send + Sync>,
}

impl Retriever {
    pub fn new(
        chunks: Arc<dyn ChunkStoreRead + Send + Sync>,
        vector: Arc<dyn VectorSearcher + Send + Sync>,
        text: Arc<dyn TextSearcher + Send + Sync>,
    ) -> Self {
        Self { chunks, vector, text }
    }

    pub async fn retrieve(
        &self,
        collection: &CollectionName,
        query: &str,
        query_vector: &[f32],
        plan: &QueryPlan,
    ) -> Result<RetrievalOutcome, RetrieverError> {
        // §4.10: over-fetch 2*retrieve_k per side before fusion narrows back down.
        let fan_out = SearchOptions::new(plan.retrieve_k).fetch_factor * plan.retrieve_k;
        let dense_opts = SearchOptions::new(fan_out);
        let lexical_opts = SearchOptions::new(fan_out);

        let (dense_result, lexical_result) = tokio::join!(
            self.search_dense(collection, query_vector, dense_opts),
            self.search_lexical(collection, query, lexical_opts),
        );

        let dense = dense_result.map_err(RetrieverError::DenseUnavailable)?;
        let (lexical, lexical_unavailable) = match lexical_result {
            Ok(matches) => (matches, false),
            Err(err) => {
                tracing::warn!(error = %err, "lexical retrieval unavailable, falling back to dense-only");
                (Vec::new(), true)
            }
        };

        let dense_norm = min_max_normalize(dense.iter().map(|m| (m.chunk_id.clone(), m.similarity)));
        let lexical_norm = min_max_normalize(lexical.iter().map(|m| (m.chunk_id.clone(), m.bm25_score)));

        let mut ids: Vec<ChunkId> = dense_norm.keys().cloned().collect();
        for id in lexical_norm.keys() {
            if !dense_norm.contains_key(id) {
                ids.push(id.clone());
            }
        }

        let mut fused: Vec<(ChunkId, f32, Option<f32>, Option<f32>)> = ids
            .into_iter()
            .map(|id| {
                let d = dense_norm.get(&id).copied();
                let l = lexical_norm.get(&id).copied();
                let score = plan.dense_weight * d.unwrap_or(0.0) + plan.lexical_weight * l.unwrap_or(0.0);
                (id, score, d, l)
            })
            .collect();
        fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0 .0.cmp(&b.0 .0)));
        fused.truncate(plan.retrieve_k);

        let top_ids: Vec<ChunkId> = fused.iter().map(|(id, ..)| id.clone()).collect();
        let chunks = self
            .chunks
            .get_chunks(collection, &top_ids)
            .map_err(RetrieverError::DenseUnavailable)?;
        let text_by_id: HashMap<ChunkId, chunk_model::Chunk> = chunks.into_iter().map(|c| (c.chunk_id.clone(), c)).collect();

        let candidates = fused
            .into_iter()
            .filter_map(|(id, score, dense_score, lexical_score)| {
                let chunk = text_by_id.get(&id)?;
                Some(RetrievalCandidate {
                    chunk_id: id,
                    text: chunk.text.clone(),
                    metadata: ChunkMetadata {
                        source: chunk.source.clone(),
                        doc_title: chunk.doc_title.clone(),
                        section_title: chunk.section_title.clone(),
                        page: chunk.page,
                    },
                    dense_score,
                    lexical_score,
                    fused_score: score,
                })
            })
            .collect();

        Ok(RetrievalOutcome { candidates, lexical_unavailable })
    }

    async fn search_dense(
        &self,
        collection: &CollectionName,
        vector: &[f32],
        opts: SearchOptions,
    ) -> Result<Vec<chunking_store::VectorMatch>, StoreError> {
        self.vector.search(collection, vector, opts)
    }

    async fn search_lexical(
        &self,
        collection: &CollectionName,
        query: &str,
        opts: SearchOptions,
    ) -> Result<Vec<chunking_store::TextMatch>, StoreError> {
        self.text.bm25_search(collection, query, opts)
    }
}

/// Min-max normalize an iterator of `(id, raw_score)` pairs to `[0, 1]`. A degenerate
/// range (empty input, or every score equal) maps everything to `0.0` rather than
/// dividing by zero.
fn min_max_normalize(scores: impl Iterator<Item = (ChunkId, f32)>) -> HashMap<ChunkId, f32> {
    let items: Vec<(ChunkId, f32)> = scores.collect();
    if items.is_empty() {
        return HashMap::new();
    }
    let min = items.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = items.iter().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    items
        .into_iter()
        .map(|(id, s)| {
            let norm = if range.abs() < f32::EPSILON { 0.0 } else { (s - min) / range };
            (id, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_model::{Chunk, QueryClass};
    use chunking_store::{TextMatch, VectorMatch};
    use std::collections::BTreeMap;

    struct FixedStore {
        dense: Vec<VectorMatch>,
        lexical: Result<Vec<TextMatch>, StoreError>,
        chunks: Vec<Chunk>,
    }

    impl ChunkStoreRead for FixedStore {
        fn get_chunks(&self, _collection: &CollectionName, ids: &[ChunkId]) -> Result<Vec<Chunk>, StoreError> {
            Ok(self.chunks.iter().filter(|c| ids.contains(&c.chunk_id)).cloned().collect())
        }
        fn list_ids_by_filter(&self, _collection: &CollectionName, _filters: &[chunking_store::FilterClause], _limit: usize) -> Result<Vec<ChunkId>, StoreError> {
            Ok(Vec::new())
        }
    }

    impl VectorSearcher for FixedStore {
        fn search(&self, _collection: &CollectionName, _vector: &[f32], _opts: SearchOptions) -> Result<Vec<VectorMatch>, StoreError> {
            Ok(self.dense.clone())
        }
    }

    impl TextSearcher for FixedStore {
        fn bm25_search(&self, _collection: &CollectionName, _query: &str, _opts: SearchOptions) -> Result<Vec<TextMatch>, StoreError> {
            match &self.lexical {
                Ok(matches) => Ok(matches.clone()),
                Err(_) => Err(StoreError::TantivyQueryParse("boom".into())),
            }
        }
    }

    fn chunk(id: &str) -> Chunk {
        Chunk {
            schema_version: 1,
            chunk_id: ChunkId(id.into()),
            collection: CollectionName("docs".into()),
            source: "doc.md".into(),
            doc_title: "Doc".into(),
            section_title: "Intro".into(),
            section_level: 1,
            section_index: 0,
            page: None,
            chunk_index_within_section: 0,
            text: format!("text for {id}"),
            token_count: 3,
            content_hash: format!("hash-{id}"),
            created_at: chrono::Utc::now(),
            meta: BTreeMap::new(),
        }
    }

    fn plan() -> QueryPlan {
        QueryPlan {
            query_class: QueryClass::Factual,
            dense_weight: 0.5,
            lexical_weight: 0.5,
            retrieve_k: 2,
            rerank_k: 2,
            use_expansion: false,
            use_rerank: true,
            plan_confidence: 0.8,
        }
    }

    #[tokio::test]
    async fn fuses_dense_and_lexical_by_configured_weights() {
        let store = Arc::new(FixedStore {
            dense: vec![VectorMatch { chunk_id: ChunkId("a".into()), similarity: 0.9 }, VectorMatch { chunk_id: ChunkId("b".into()), similarity: 0.1 }],
            lexical: Ok(vec![TextMatch { chunk_id: ChunkId("a".into()), bm25_score: 1.0 }, TextMatch { chunk_id: ChunkId("b".into()), bm25_score: 9.0 }]),
            chunks: vec![chunk("a"), chunk("b")],
        });
        let retriever = Retriever::new(store.clone(), store.clone(), store);
        let collection = CollectionName("docs".into());
        let outcome = retriever.retrieve(&collection, "q", &[0.1, 0.2], &plan()).await.unwrap();
        assert!(!outcome.lexical_unavailable);
        assert_eq!(outcome.candidates.len(), 2);
        // a: dense_norm=1.0, lexical_norm=0.0 -> fused 0.5; b: dense_norm=0.0, lexical_norm=1.0 -> fused 0.5
        assert!((outcome.candidates[0].fused_score - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn lexical_failure_falls_back_to_dense_only() {
        let store = Arc::new(FixedStore {
            dense: vec![VectorMatch { chunk_id: ChunkId("a".into()), similarity: 0.9 }],
            lexical: Err(StoreError::TantivyQueryParse("boom".into())),
            chunks: vec![chunk("a")],
        });
        let retriever = Retriever::new(store.clone(), store.clone(), store);
        let collection = CollectionName("docs".into());
        let outcome = retriever.retrieve(&collection, "q", &[0.1], &plan()).await.unwrap();
        assert!(outcome.lexical_unavailable);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].lexical_score, None);
    }

    #[tokio::test]
    async fn degenerate_score_range_normalizes_to_zero() {
        let store = Arc::new(FixedStore {
            dense: vec![VectorMatch { chunk_id: ChunkId("a".into()), similarity: 0.5 }, VectorMatch { chunk_id: ChunkId("b".into()), similarity: 0.5 }],
            lexical: Ok(vec![]),
            chunks: vec![chunk("a"), chunk("b")],
        });
        let retriever = Retriever::new(store.clone(), store.clone(), store);
        let collection = CollectionName("docs".into());
        let outcome = retriever.retrieve(&collection, "q", &[0.1], &plan()).await.unwrap();
        for candidate in &outcome.candidates {
            assert_eq!(candidate.dense_score, Some(0.0));
        }
    }
}
