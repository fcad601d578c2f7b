//! Indexer (§4.8): the single entry point that keeps the primary store, dedup
//! registry, lexical index, and vector index consistent for one collection's
//! ingest/delete/reindex/migrate operations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use chunk_model::{fingerprint, Chunk, ChunkId, CollectionInfo, CollectionName};

use crate::dedup::{DedupOutcome, Deduper};
use crate::sqlite_repo::SqliteRepo;
use crate::{ChunkStoreRead, FilterClause, StoreError, TextIndexMaintainer, VectorIndexMaintainer};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestReport {
    pub admitted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteReport {
    pub deleted: usize,
}

/// Ties the primary store, dedup registry, and index adapters together behind the
/// four operations an ingest caller needs.
pub struct Indexer {
    repo: Arc<SqliteRepo>,
    text_index: Arc<dyn TextIndexMaintainer + Send + Sync>,
    vector_index: Arc<dyn VectorIndexMaintainer + Send + Sync>,
    dedupers: DashMap<CollectionName, Arc<Deduper>>,
}

impl Indexer {
    /// Construct an `Indexer` and immediately rehydrate every collection already
    /// known to `repo` into `text_index`/`vector_index` (§4.7, §6). Neither adapter
    /// persists to disk on its own, so without this a process restart would leave
    /// them empty while the dedup registry still remembers every content hash —
    /// `new_chunks` would come back empty on the next ingest and the indexes could
    /// never be repopulated.
    pub fn new(
        repo: Arc<SqliteRepo>,
        text_index: Arc<dyn TextIndexMaintainer + Send + Sync>,
        vector_index: Arc<dyn VectorIndexMaintainer + Send + Sync>,
    ) -> Result<Self, OrchestratorError> {
        let indexer = Self { repo, text_index, vector_index, dedupers: DashMap::new() };
        indexer.rehydrate_all()?;
        Ok(indexer)
    }

    pub fn repo(&self) -> &SqliteRepo {
        &self.repo
    }

    fn rehydrate_all(&self) -> Result<(), OrchestratorError> {
        for collection in self.repo.list_collection_names()? {
            self.rehydrate_indexes(&collection)?;
            let deduper = Arc::new(Deduper::rehydrate(&self.repo, collection.clone())?);
            self.dedupers.insert(collection, deduper);
        }
        Ok(())
    }

    /// Rebuild the lexical index from chunk text and the vector index from
    /// persisted embeddings, both durable in `repo`, for one collection.
    fn rehydrate_indexes(&self, collection: &CollectionName) -> Result<(), OrchestratorError> {
        let chunks = self.repo.list_all_chunks(collection)?;
        if chunks.is_empty() {
            return Ok(());
        }
        self.text_index.ensure_index(collection)?;
        self.text_index.bulk_upsert(collection, &chunks)?;

        let embeddings = self.repo.list_all_embeddings(collection)?;
        if let Some((_, first)) = embeddings.first() {
            let dim = first.len();
            self.vector_index.ensure_collection(collection, dim)?;
            self.vector_index.upsert(collection, &embeddings)?;
        }
        Ok(())
    }

    fn deduper_for(&self, collection: &CollectionName) -> Result<Arc<Deduper>, OrchestratorError> {
        if let Some(d) = self.dedupers.get(collection) {
            return Ok(d.clone());
        }
        // Not seen at construction time: a brand-new collection, nothing to
        // rehydrate into the indexes yet.
        let deduper = Arc::new(Deduper::rehydrate(&self.repo, collection.clone())?);
        self.dedupers.insert(collection.clone(), deduper.clone());
        Ok(deduper)
    }

    /// Admit a batch of chunks (with optional embeddings) into a collection,
    /// skipping any whose content hash is already registered (§4.7).
    pub fn upsert(
        &self,
        collection: &CollectionName,
        chunks: Vec<Chunk>,
        vectors: Vec<(ChunkId, Vec<f32>)>,
        dim: usize,
    ) -> Result<IngestReport, OrchestratorError> {
        if chunks.is_empty() {
            return Ok(IngestReport::default());
        }
        let deduper = self.deduper_for(collection)?;

        let mut new_chunks = Vec::with_capacity(chunks.len());
        let mut duplicates = 0usize;
        for chunk in chunks {
            match deduper.classify(&chunk.content_hash) {
                DedupOutcome::Duplicate(_) => duplicates += 1,
                DedupOutcome::New => new_chunks.push(chunk),
            }
        }

        if !new_chunks.is_empty() {
            self.repo.upsert_chunks(&new_chunks)?;
            self.text_index.ensure_index(collection)?;
            self.text_index.bulk_upsert(collection, &new_chunks)?;

            let admitted_ids: std::collections::HashSet<&ChunkId> = new_chunks.iter().map(|c| &c.chunk_id).collect();
            let new_vectors: Vec<_> = vectors.into_iter().filter(|(id, _)| admitted_ids.contains(id)).collect();
            if !new_vectors.is_empty() {
                self.vector_index.ensure_collection(collection, dim)?;
                self.vector_index.upsert(collection, &new_vectors)?;
                self.repo.upsert_embeddings(collection, &new_vectors)?;
            }

            for chunk in &new_chunks {
                deduper.commit(&self.repo, &chunk.content_hash, chunk.chunk_id.clone())?;
            }
        }

        let admitted = new_chunks.len();
        self.repo.record_dedup_stats(collection, (admitted + duplicates) as u64, duplicates as u64)?;

        Ok(IngestReport { admitted, duplicates })
    }

    /// Delete every chunk whose `source` matches, from the primary store and both
    /// indexes, and free the corresponding dedup-registry entries so identical
    /// content can be re-admitted later.
    pub fn delete_by_source(&self, collection: &CollectionName, source: &str) -> Result<DeleteReport, OrchestratorError> {
        let ids = self.repo.list_ids_by_source(collection, source)?;
        if ids.is_empty() {
            return Ok(DeleteReport::default());
        }
        let deduper = self.deduper_for(collection)?;
        for id in &ids {
            if let Some(chunk) = self.repo.get_chunk(collection, id)? {
                deduper.forget(&self.repo, &chunk.content_hash)?;
            }
        }
        let deleted = self.repo.delete_by_ids(collection, &ids)?;
        self.text_index.delete(collection, &ids)?;
        self.vector_index.delete(collection, &ids)?;
        self.repo.delete_embeddings(collection, &ids)?;
        Ok(DeleteReport { deleted })
    }

    /// Delete chunks matching arbitrary filter clauses, looping in batches since the
    /// primary store is the only enumerable side (Open Question decision #2).
    pub fn delete_by_filter(&self, collection: &CollectionName, filters: &[FilterClause], batch_size: usize) -> Result<DeleteReport, OrchestratorError> {
        let mut report = DeleteReport::default();
        let batch = batch_size.max(1);
        loop {
            let ids = self.repo.list_ids_by_filter(collection, filters, batch)?;
            if ids.is_empty() {
                break;
            }
            let deduper = self.deduper_for(collection)?;
            for id in &ids {
                if let Some(chunk) = self.repo.get_chunk(collection, id)? {
                    deduper.forget(&self.repo, &chunk.content_hash)?;
                }
            }
            report.deleted += self.repo.delete_by_ids(collection, &ids)?;
            self.text_index.delete(collection, &ids)?;
            self.vector_index.delete(collection, &ids)?;
            self.repo.delete_embeddings(collection, &ids)?;
        }
        Ok(report)
    }

    /// Rebuild the lexical index for every chunk from `source`, using the text
    /// already stored in the primary store. Re-populating the vector index still
    /// requires fresh embeddings from the caller — `reindex_source` is for "the
    /// chunk text changed", not cold start, which `Indexer::new` handles from
    /// whatever embeddings are already durable.
    pub fn reindex_source(
        &self,
        collection: &CollectionName,
        source: &str,
        vectors: Option<&[(ChunkId, Vec<f32>)]>,
        dim: usize,
    ) -> Result<usize, OrchestratorError> {
        let ids = self.repo.list_ids_by_source(collection, source)?;
        let chunks = self.repo.get_chunks(collection, &ids)?;
        if chunks.is_empty() {
            return Ok(0);
        }
        self.text_index.ensure_index(collection)?;
        self.text_index.bulk_upsert(collection, &chunks)?;
        if let Some(vectors) = vectors {
            self.vector_index.ensure_collection(collection, dim)?;
            self.vector_index.upsert(collection, vectors)?;
            self.repo.upsert_embeddings(collection, vectors)?;
        }
        Ok(chunks.len())
    }

    /// Copy every chunk from `from` into a freshly named `to` collection, rebuilding
    /// both indexes under the new name and recording `migrated_from` in the target's
    /// [`CollectionInfo`]. The source collection is left untouched.
    ///
    /// `vectors` is keyed by each chunk's *original* (`from`-scoped) id, matching how
    /// callers re-embed straight off [`SqliteRepo::list_all_chunks`]; it's remapped to
    /// the recomputed `to`-scoped id before it reaches the vector index or the primary
    /// store.
    pub fn migrate_collection(
        &self,
        from: &CollectionName,
        to: &CollectionName,
        model_id: &str,
        dim: usize,
        vectors: &[(ChunkId, Vec<f32>)],
    ) -> Result<usize, OrchestratorError> {
        let source_chunks = self.repo.list_all_chunks(from)?;
        if source_chunks.is_empty() {
            return Ok(0);
        }

        // §3's identity invariant is `H(collection, source, section_index,
        // chunk_index_within_section)`: keeping the `from`-scoped id here would let a
        // later native ingest into `to` mint a different id for identical content and
        // duplicate the row instead of updating it.
        let mut id_map: HashMap<ChunkId, ChunkId> = HashMap::with_capacity(source_chunks.len());
        let retargeted: Vec<Chunk> = source_chunks
            .into_iter()
            .map(|mut c| {
                let new_id = ChunkId(fingerprint::chunk_id(to, &c.source, c.section_index, c.chunk_index_within_section));
                id_map.insert(c.chunk_id.clone(), new_id.clone());
                c.collection = to.clone();
                c.chunk_id = new_id;
                c
            })
            .collect();

        self.repo.upsert_chunks(&retargeted)?;
        self.text_index.ensure_index(to)?;
        self.text_index.bulk_upsert(to, &retargeted)?;

        let remapped_vectors: Vec<(ChunkId, Vec<f32>)> = vectors
            .iter()
            .filter_map(|(old_id, vector)| id_map.get(old_id).map(|new_id| (new_id.clone(), vector.clone())))
            .collect();
        if !remapped_vectors.is_empty() {
            self.vector_index.ensure_collection(to, dim)?;
            self.vector_index.upsert(to, &remapped_vectors)?;
            self.repo.upsert_embeddings(to, &remapped_vectors)?;
        }

        // Register the migrated content under `to`'s dedup registry so a subsequent
        // native ingest of the same source recognizes it as already-seen rather than
        // re-admitting (the recomputed chunk_id alone already prevents a duplicate
        // row; this keeps the duplicate-rate stats and registry consistent too).
        let deduper = self.deduper_for(to)?;
        for chunk in &retargeted {
            deduper.commit(&self.repo, &chunk.content_hash, chunk.chunk_id.clone())?;
        }

        self.repo.upsert_collection_info(&CollectionInfo {
            name: to.clone(),
            model_id: model_id.to_string(),
            dimension: dim,
            created_at: Utc::now(),
            chunk_count: retargeted.len() as u64,
            migrated_from: Some(from.clone()),
        })?;

        Ok(retargeted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw_index::HnswVectorIndex;
    use crate::tantivy_index::TantivyTextIndex;
    use crate::{SearchOptions, TextSearcher, VectorSearcher};
    use std::collections::BTreeMap;

    fn chunk(id: &str, source: &str, hash: &str, text: &str) -> Chunk {
        Chunk {
            schema_version: 1,
            chunk_id: ChunkId(id.into()),
            collection: CollectionName("docs".into()),
            source: source.into(),
            doc_title: "Doc".into(),
            section_title: "Intro".into(),
            section_level: 1,
            section_index: 0,
            page: None,
            chunk_index_within_section: 0,
            text: text.into(),
            token_count: text.split_whitespace().count(),
            content_hash: hash.into(),
            created_at: Utc::now(),
            meta: BTreeMap::new(),
        }
    }

    fn indexer() -> Indexer {
        let repo = Arc::new(SqliteRepo::open_in_memory().unwrap());
        let text = Arc::new(TantivyTextIndex::new());
        let vector = Arc::new(HnswVectorIndex::new());
        Indexer::new(repo, text, vector).unwrap()
    }

    #[test]
    fn upsert_skips_duplicate_content_hash() {
        let indexer = indexer();
        let collection = CollectionName("docs".into());
        let report = indexer
            .upsert(&collection, vec![chunk("a", "x.md", "h1", "hello")], vec![], 0)
            .unwrap();
        assert_eq!(report.admitted, 1);

        let report2 = indexer
            .upsert(&collection, vec![chunk("b", "x.md", "h1", "hello")], vec![], 0)
            .unwrap();
        assert_eq!(report2.admitted, 0);
        assert_eq!(report2.duplicates, 1);
    }

    #[test]
    fn delete_by_source_clears_store_and_dedup() {
        let indexer = indexer();
        let collection = CollectionName("docs".into());
        indexer.upsert(&collection, vec![chunk("a", "x.md", "h1", "hello")], vec![], 0).unwrap();
        let report = indexer.delete_by_source(&collection, "x.md").unwrap();
        assert_eq!(report.deleted, 1);

        // identical content should be re-admittable now that its hash was forgotten
        let report2 = indexer.upsert(&collection, vec![chunk("b", "x.md", "h1", "hello")], vec![], 0).unwrap();
        assert_eq!(report2.admitted, 1);
    }

    #[test]
    fn migrate_collection_recomputes_chunk_id_for_target_collection() {
        let indexer = indexer();
        let from = CollectionName("docs".into());
        let to = CollectionName("docs-v2".into());
        indexer.upsert(&from, vec![chunk("a", "x.md", "h1", "hello")], vec![], 0).unwrap();
        let migrated = indexer.migrate_collection(&from, &to, "model-a", 0, &[]).unwrap();
        assert_eq!(migrated, 1);

        // the migrated chunk is NOT stored under its `from`-scoped id "a"...
        assert!(indexer.repo().get_chunk(&to, &ChunkId("a".into())).unwrap().is_none());
        // ...it's stored under the id a native ingest into `to` would compute.
        let expected_id = ChunkId(fingerprint::chunk_id(&to, "x.md", 0, 0));
        assert!(indexer.repo().get_chunk(&to, &expected_id).unwrap().is_some());
    }

    #[test]
    fn migrate_collection_vectors_are_remapped_from_old_to_new_chunk_id() {
        let indexer = indexer();
        let from = CollectionName("docs".into());
        let to = CollectionName("docs-v2".into());
        indexer.upsert(&from, vec![chunk("a", "x.md", "h1", "hello")], vec![(ChunkId("a".into()), vec![1.0, 0.0])], 2).unwrap();

        // `vectors` is keyed by the original ("a") id, as callers pull it straight off
        // `list_all_chunks(from)`.
        let migrated = indexer.migrate_collection(&from, &to, "model-a", 2, &[(ChunkId("a".into()), vec![1.0, 0.0])]).unwrap();
        assert_eq!(migrated, 1);

        let expected_id = ChunkId(fingerprint::chunk_id(&to, "x.md", 0, 0));
        let embeddings = indexer.repo().list_all_embeddings(&to).unwrap();
        assert_eq!(embeddings, vec![(expected_id, vec![1.0, 0.0])]);
    }

    #[test]
    fn migrate_then_native_ingest_updates_same_row_instead_of_duplicating() {
        let indexer = indexer();
        let from = CollectionName("docs".into());
        let to = CollectionName("docs-v2".into());
        indexer.upsert(&from, vec![chunk("a", "x.md", "h1", "hello")], vec![], 0).unwrap();
        indexer.migrate_collection(&from, &to, "model-a", 0, &[]).unwrap();

        // a native ingest into `to` for the same source/section/content computes the
        // same chunk_id the migration did, so it's recognized as a duplicate rather
        // than creating a second row for identical content.
        let report = indexer.upsert(&to, vec![chunk("whatever-id", "x.md", "h1", "hello")], vec![], 0).unwrap();
        assert_eq!(report.admitted, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(indexer.repo().counts(&to).unwrap(), 1);
    }

    #[test]
    fn cold_start_rehydrates_indexes_so_queries_are_not_silently_empty() {
        let repo = Arc::new(SqliteRepo::open_in_memory().unwrap());
        let text = Arc::new(TantivyTextIndex::new());
        let vector = Arc::new(HnswVectorIndex::new());
        let collection = CollectionName("docs".into());
        {
            let indexer = Indexer::new(repo.clone(), text.clone(), vector.clone()).unwrap();
            indexer
                .upsert(&collection, vec![chunk("a", "x.md", "h1", "hello world")], vec![(ChunkId("a".into()), vec![1.0, 0.0])], 2)
                .unwrap();
        }

        // simulate a process restart: fresh in-memory adapters, same durable repo.
        let fresh_text = Arc::new(TantivyTextIndex::new());
        let fresh_vector = Arc::new(HnswVectorIndex::new());
        let restarted = Indexer::new(repo, fresh_text.clone(), fresh_vector.clone()).unwrap();

        let hits = fresh_text.bm25_search(&collection, "hello", SearchOptions::new(5)).unwrap();
        assert_eq!(hits.len(), 1, "lexical index must be rebuilt from durable chunk text on cold start");
        let matches = fresh_vector.search(&collection, &[1.0, 0.0], SearchOptions::new(5)).unwrap();
        assert_eq!(matches.len(), 1, "vector index must be rebuilt from persisted embeddings on cold start");

        // and the dedup registry is still in effect: re-ingesting identical content
        // classifies as a duplicate rather than being silently lost as "new" again.
        let report = restarted.upsert(&collection, vec![chunk("b", "x.md", "h1", "hello world")], vec![], 0).unwrap();
        assert_eq!(report.duplicates, 1);
    }
}
