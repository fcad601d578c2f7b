//! BM25 lexical index adapter (§4.5), backed by Tantivy. One in-RAM Tantivy index per
//! collection, keyed in a [`DashMap`] so concurrent collections don't share a writer.
//!
//! The teacher kept this behind a `tantivy-impl` feature flag with a no-op stub as the
//! default build; this system always needs lexical search, so it's unconditional here.

use chrono::Utc;
use dashmap::DashMap;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, NumericOptions, Schema, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader};

use chunk_model::{Chunk, ChunkId, CollectionName};

use crate::{SearchOptions, StoreError, TextIndexMaintainer, TextMatch, TextSearcher};

struct CollectionIndex {
    index: Index,
    reader: IndexReader,
    f_text: Field,
    f_chunk_id: Field,
    f_source: Field,
    f_section_title: Field,
    f_created_at_ts: Field,
}

impl CollectionIndex {
    fn new_ram() -> Result<Self, StoreError> {
        let mut builder = Schema::builder();
        let f_text = builder.add_text_field("text", TEXT);
        let f_chunk_id = builder.add_text_field("chunk_id", STRING | STORED);
        let f_source = builder.add_text_field("source", STRING);
        let f_section_title = builder.add_text_field("section_title", TEXT);
        let num_opts = NumericOptions::default().set_fast().set_indexed();
        let f_created_at_ts = builder.add_i64_field("created_at_ts", num_opts);
        let schema = builder.build();
        let index = Index::create_in_ram(schema);
        let reader = index.reader()?;
        Ok(Self { index, reader, f_text, f_chunk_id, f_source, f_section_title, f_created_at_ts })
    }

    fn upsert(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
        let mut writer = self.index.writer(50_000_000)?;
        for c in chunks {
            // Delete any existing doc for this chunk_id first: Tantivy has no native
            // upsert, and this adapter's contract (§4.5, mirroring §4.4) is idempotent
            // keyed by chunk_id, not append-only.
            let term = tantivy::Term::from_field_text(self.f_chunk_id, &c.chunk_id.0);
            writer.delete_term(term);
            let document = doc!(
                self.f_chunk_id => c.chunk_id.0.clone(),
                self.f_source => c.source.clone(),
                self.f_section_title => c.section_title.clone(),
                self.f_text => c.text.clone(),
                self.f_created_at_ts => c.created_at.timestamp(),
            );
            writer.add_document(document)?;
        }
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<(), StoreError> {
        let mut writer = self.index.writer(50_000_000)?;
        for id in ids {
            let term = tantivy::Term::from_field_text(self.f_chunk_id, &id.0);
            writer.delete_term(term);
        }
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }
}

pub struct TantivyTextIndex {
    collections: DashMap<CollectionName, CollectionIndex>,
}

impl TantivyTextIndex {
    pub fn new() -> Self {
        Self { collections: DashMap::new() }
    }

    fn get_or_create(&self, collection: &CollectionName) -> Result<(), StoreError> {
        if !self.collections.contains_key(collection) {
            self.collections.insert(collection.clone(), CollectionIndex::new_ram()?);
        }
        Ok(())
    }
}

impl Default for TantivyTextIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TextIndexMaintainer for TantivyTextIndex {
    fn ensure_index(&self, collection: &CollectionName) -> Result<(), StoreError> {
        self.get_or_create(collection)
    }

    fn bulk_upsert(&self, collection: &CollectionName, chunks: &[Chunk]) -> Result<(), StoreError> {
        self.get_or_create(collection)?;
        let entry = self.collections.get(collection).expect("just inserted");
        entry.upsert(chunks)
    }

    fn delete(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<(), StoreError> {
        let Some(entry) = self.collections.get(collection) else { return Ok(()) };
        entry.delete(ids)
    }
}

impl TextSearcher for TantivyTextIndex {
    fn bm25_search(&self, collection: &CollectionName, query: &str, opts: SearchOptions) -> Result<Vec<TextMatch>, StoreError> {
        let Some(entry) = self.collections.get(collection) else {
            return Err(StoreError::CollectionNotFound(collection.0.clone()));
        };
        if query.trim().is_empty() || opts.top_k == 0 {
            return Ok(Vec::new());
        }
        let parser = QueryParser::for_index(&entry.index, vec![entry.f_text, entry.f_source, entry.f_section_title]);
        let parsed = parser
            .parse_query(query.trim())
            .map_err(|e| StoreError::TantivyQueryParse(e.to_string()))?;
        let searcher = entry.reader.searcher();
        let fetch_n = opts.top_k.saturating_mul(opts.fetch_factor).max(opts.top_k);
        let top_docs = searcher.search(&parsed, &TopDocs::with_limit(fetch_n))?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (raw_score, addr) in top_docs {
            let document = searcher.doc::<tantivy::schema::document::TantivyDocument>(addr)?;
            if let Some(tantivy::schema::OwnedValue::Str(cid)) = document.get_first(entry.f_chunk_id) {
                // sigmoid keeps the lexical score on the same [0,1] scale as the
                // dense cosine-similarity score before min-max fusion normalizes both.
                let score = 1.0f32 / (1.0f32 + (-raw_score).exp());
                out.push(TextMatch { chunk_id: ChunkId(cid.to_string()), bm25_score: score });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            schema_version: 1,
            chunk_id: ChunkId(id.into()),
            collection: CollectionName("docs".into()),
            source: "a.md".into(),
            doc_title: "Doc".into(),
            section_title: "Intro".into(),
            section_level: 1,
            section_index: 0,
            page: None,
            chunk_index_within_section: 0,
            text: text.into(),
            token_count: text.split_whitespace().count(),
            content_hash: "h".into(),
            created_at: Utc::now(),
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn search_finds_upserted_chunk() {
        let index = TantivyTextIndex::new();
        let collection = CollectionName("docs".into());
        index.ensure_index(&collection).unwrap();
        index.bulk_upsert(&collection, &[chunk("c1", "the quick brown fox")]).unwrap();
        let hits = index.bm25_search(&collection, "fox", SearchOptions::new(5)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, ChunkId("c1".into()));
    }

    #[test]
    fn repeated_upsert_of_same_chunk_id_does_not_duplicate_hits() {
        let index = TantivyTextIndex::new();
        let collection = CollectionName("docs".into());
        index.ensure_index(&collection).unwrap();
        index.bulk_upsert(&collection, &[chunk("c1", "the quick brown fox")]).unwrap();
        index.bulk_upsert(&collection, &[chunk("c1", "the quick brown fox")]).unwrap();
        let hits = index.bm25_search(&collection, "fox", SearchOptions::new(5)).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_removes_from_results() {
        let index = TantivyTextIndex::new();
        let collection = CollectionName("docs".into());
        index.ensure_index(&collection).unwrap();
        index.bulk_upsert(&collection, &[chunk("c1", "unique mango flavor")]).unwrap();
        index.delete(&collection, &[ChunkId("c1".into())]).unwrap();
        let hits = index.bm25_search(&collection, "mango", SearchOptions::new(5)).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn search_on_unknown_collection_errors() {
        let index = TantivyTextIndex::new();
        let collection = CollectionName("missing".into());
        let result = index.bm25_search(&collection, "fox", SearchOptions::new(5));
        assert!(matches!(result, Err(StoreError::CollectionNotFound(_))));
    }
}
