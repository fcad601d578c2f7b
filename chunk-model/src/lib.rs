//! Shared data model used across the retrieval, indexing, and orchestration crates.
//!
//! Kept deliberately free of I/O: every type here is a plain value record keyed by
//! id, with the owning registries (dedup registry, vector store, lexical index) living
//! in their own crates. No back-pointers between `Chunk` and `Embedding` or between
//! `Collection` and its chunks — callers look things up by id instead.

pub mod fingerprint;
mod ids;
mod span;
mod types;

pub use ids::{ChunkId, CollectionName};
pub use span::{Span, SpanStatus};
pub use types::{
    Answer, Chunk, ChunkMetadata, Citation, ClientQuota, CollectionInfo, Embedding,
    LatencyBreakdown, QueryClass, QueryPlan, RerankKey, RetrievalCandidate, SCHEMA_MAJOR,
};
