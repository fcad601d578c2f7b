//! Dense vector store adapter (§4.4), backed by `hnsw_rs`.
//!
//! `hnsw_rs` has no delete operation and its graph borrows the vectors it indexes, so
//! a single long-lived graph can't hold deletable, owned data without unsafe
//! self-referencing. Instead each collection keeps an in-memory sidecar of
//! `(ChunkId, Vec<f32>)` pairs as the source of truth, and a fresh graph is built from
//! it on each search. This trades per-query build latency for a correct, safe delete
//! path — acceptable at the chunk counts this system targets (single-digit millions
//! at most per collection).
//!
//! The sidecar itself holds no durability: it's rebuilt on process start from
//! [`crate::sqlite_repo::SqliteRepo`]'s persisted `embeddings` table by
//! [`crate::orchestrator::Indexer::new`], which is the actual §6 persistence
//! boundary for this adapter.

use dashmap::DashMap;
use hnsw_rs::prelude::*;
use parking_lot::RwLock;

use chunk_model::{ChunkId, CollectionName};

use crate::{SearchOptions, StoreError, VectorIndexMaintainer, VectorMatch, VectorSearcher};

const MAX_NB_CONNECTION: usize = 24;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;
const MAX_LAYER: usize = 16;

struct CollectionSidecar {
    dim: usize,
    vectors: RwLock<Vec<(ChunkId, Vec<f32>)>>,
}

pub struct HnswVectorIndex {
    collections: DashMap<CollectionName, CollectionSidecar>,
}

impl HnswVectorIndex {
    pub fn new() -> Self {
        Self { collections: DashMap::new() }
    }
}

impl Default for HnswVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndexMaintainer for HnswVectorIndex {
    fn ensure_collection(&self, collection: &CollectionName, dim: usize) -> Result<(), StoreError> {
        self.collections
            .entry(collection.clone())
            .or_insert_with(|| CollectionSidecar { dim, vectors: RwLock::new(Vec::new()) });
        Ok(())
    }

    fn upsert(&self, collection: &CollectionName, items: &[(ChunkId, Vec<f32>)]) -> Result<(), StoreError> {
        let Some(entry) = self.collections.get(collection) else {
            return Err(StoreError::CollectionNotFound(collection.0.clone()));
        };
        for (_, vector) in items {
            if vector.len() != entry.dim {
                return Err(StoreError::DimensionMismatch { expected: entry.dim, actual: vector.len() });
            }
        }
        let mut vectors = entry.vectors.write();
        for (id, vector) in items {
            match vectors.iter_mut().find(|(existing, _)| existing == id) {
                Some((_, slot)) => *slot = vector.clone(),
                None => vectors.push((id.clone(), vector.clone())),
            }
        }
        Ok(())
    }

    fn delete(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<(), StoreError> {
        let Some(entry) = self.collections.get(collection) else { return Ok(()) };
        entry.vectors.write().retain(|(id, _)| !ids.contains(id));
        Ok(())
    }
}

impl VectorSearcher for HnswVectorIndex {
    fn search(&self, collection: &CollectionName, vector: &[f32], opts: SearchOptions) -> Result<Vec<VectorMatch>, StoreError> {
        let Some(entry) = self.collections.get(collection) else {
            return Err(StoreError::CollectionNotFound(collection.0.clone()));
        };
        if vector.len() != entry.dim {
            return Err(StoreError::DimensionMismatch { expected: entry.dim, actual: vector.len() });
        }
        let vectors = entry.vectors.read();
        if vectors.is_empty() || opts.top_k == 0 {
            return Ok(Vec::new());
        }

        let graph: Hnsw<f32, DistCosine> =
            Hnsw::new(MAX_NB_CONNECTION, vectors.len(), MAX_LAYER, EF_CONSTRUCTION, DistCosine {});
        for (idx, (_, v)) in vectors.iter().enumerate() {
            graph.insert((v.as_slice(), idx));
        }

        let fetch_n = opts.top_k.saturating_mul(opts.fetch_factor).max(opts.top_k);
        let neighbours = graph.search(vector, fetch_n, EF_SEARCH);

        let mut out = Vec::with_capacity(neighbours.len());
        for n in neighbours {
            let (chunk_id, _) = &vectors[n.d_id];
            // DistCosine returns a distance in [0, 2]; similarity = 1 - distance/2
            // keeps the scale aligned with the dense score fusion expects ([0, 1]).
            let similarity = (1.0 - n.distance / 2.0).clamp(0.0, 1.0);
            out.push(VectorMatch { chunk_id: chunk_id.clone(), similarity });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec3(a: f32, b: f32, c: f32) -> Vec<f32> {
        vec![a, b, c]
    }

    #[test]
    fn search_returns_nearest_by_cosine() {
        let index = HnswVectorIndex::new();
        let collection = CollectionName("docs".into());
        index.ensure_collection(&collection, 3).unwrap();
        index
            .upsert(
                &collection,
                &[
                    (ChunkId("a".into()), vec3(1.0, 0.0, 0.0)),
                    (ChunkId("b".into()), vec3(0.0, 1.0, 0.0)),
                    (ChunkId("c".into()), vec3(0.9, 0.1, 0.0)),
                ],
            )
            .unwrap();

        let hits = index.search(&collection, &vec3(1.0, 0.0, 0.0), SearchOptions::new(2)).unwrap();
        assert_eq!(hits[0].chunk_id, ChunkId("a".into()));
    }

    #[test]
    fn delete_removes_vector_from_future_searches() {
        let index = HnswVectorIndex::new();
        let collection = CollectionName("docs".into());
        index.ensure_collection(&collection, 3).unwrap();
        index.upsert(&collection, &[(ChunkId("a".into()), vec3(1.0, 0.0, 0.0))]).unwrap();
        index.delete(&collection, &[ChunkId("a".into())]).unwrap();
        let hits = index.search(&collection, &vec3(1.0, 0.0, 0.0), SearchOptions::new(2)).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let index = HnswVectorIndex::new();
        let collection = CollectionName("docs".into());
        index.ensure_collection(&collection, 3).unwrap();
        let result = index.upsert(&collection, &[(ChunkId("a".into()), vec![1.0, 0.0])]);
        assert!(matches!(result, Err(StoreError::DimensionMismatch { expected: 3, actual: 2 })));
    }
}
