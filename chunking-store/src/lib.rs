//! Primary chunk storage plus the text and vector index adapters that sit behind it.
//!
//! The SQLite-backed [`sqlite_repo::SqliteRepo`] is the enumerable system of record
//! (§4.8's Indexer reads/writes it directly); the [`tantivy_index`] and
//! [`hnsw_index`] adapters are mutated from it and are never themselves queried for
//! enumeration. [`dedup`] maintains the per-collection content-hash registry described
//! in §4.7, rehydrated from the primary store on cold start. [`orchestrator`] ties all
//! of the above into the Indexer's `upsert`/`delete_by_source`/`reindex_source`/
//! `migrate_collection` operations.

pub mod dedup;
pub mod hnsw_index;
pub mod orchestrator;
pub mod sqlite_repo;
pub mod tantivy_index;

use chrono::{DateTime, Utc};
use chunk_model::{ChunkId, CollectionName};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
    #[error("tantivy query parse error: {0}")]
    TantivyQueryParse(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A single predicate applied to a chunk's stored fields. All clauses passed to one
/// call are AND-ed together; the spec never asks for OR/NOT combinators.
#[derive(Debug, Clone)]
pub enum FilterOp {
    SourceEq(String),
    SourceIn(Vec<String>),
    SourcePrefix(String),
    MetaEq(String, String),
    CreatedAtRange { start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone)]
pub struct FilterClause {
    pub op: FilterOp,
}

impl FilterClause {
    pub fn source_eq(source: impl Into<String>) -> Self {
        Self { op: FilterOp::SourceEq(source.into()) }
    }
}

/// Tuning knobs for a lexical/dense search call.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Multiplier applied to `top_k` when over-fetching from the backend before
    /// filtering, mirroring the Retriever's `2*retrieve_k` fan-out (§4.10).
    pub fetch_factor: usize,
}

impl SearchOptions {
    pub fn new(top_k: usize) -> Self {
        Self { top_k, fetch_factor: 2 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub chunk_id: ChunkId,
    pub bm25_score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: ChunkId,
    pub similarity: f32,
}

/// Read-only view over the primary chunk store, used by index adapters that need to
/// resolve a chunk's fields before indexing it (e.g. the section title Tantivy
/// stores as a separate field).
pub trait ChunkStoreRead {
    fn get_chunks(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<Vec<chunk_model::Chunk>, StoreError>;
    fn list_ids_by_filter(
        &self,
        collection: &CollectionName,
        filters: &[FilterClause],
        limit: usize,
    ) -> Result<Vec<ChunkId>, StoreError>;
}

/// §4.5 Lexical Index Adapter write side.
pub trait TextIndexMaintainer {
    fn ensure_index(&self, collection: &CollectionName) -> Result<(), StoreError>;
    fn bulk_upsert(&self, collection: &CollectionName, chunks: &[chunk_model::Chunk]) -> Result<(), StoreError>;
    fn delete(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<(), StoreError>;
}

/// §4.5 Lexical Index Adapter read side.
pub trait TextSearcher {
    fn bm25_search(
        &self,
        collection: &CollectionName,
        query: &str,
        opts: SearchOptions,
    ) -> Result<Vec<TextMatch>, StoreError>;
}

/// §4.4 Vector Store Adapter write side.
pub trait VectorIndexMaintainer {
    fn ensure_collection(&self, collection: &CollectionName, dim: usize) -> Result<(), StoreError>;
    fn upsert(&self, collection: &CollectionName, items: &[(ChunkId, Vec<f32>)]) -> Result<(), StoreError>;
    fn delete(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<(), StoreError>;
}

/// §4.4 Vector Store Adapter read side.
pub trait VectorSearcher {
    fn search(
        &self,
        collection: &CollectionName,
        vector: &[f32],
        opts: SearchOptions,
    ) -> Result<Vec<VectorMatch>, StoreError>;
}
