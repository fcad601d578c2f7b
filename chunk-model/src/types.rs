use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChunkId, CollectionName};

/// Schema revision stamped on every persisted [`Chunk`]; bump when the on-disk shape changes.
pub const SCHEMA_MAJOR: u32 = 1;

/// A unit of indexed content, carrying the structural metadata recovered by the chunker.
///
/// `chunk_id` is derived and stable: `H(collection, source, section_index,
/// chunk_index_within_section)`. Two chunks sharing `content_hash` within the same
/// collection are treated as one by the [deduper](crate) / indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub schema_version: u32,
    pub chunk_id: ChunkId,
    pub collection: CollectionName,
    pub source: String,
    pub doc_title: String,
    pub section_title: String,
    pub section_level: u8,
    pub section_index: u32,
    pub page: Option<u32>,
    pub chunk_index_within_section: u32,
    pub text: String,
    pub token_count: usize,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl Chunk {
    /// Cheap structural sanity check, mirroring the soft validation the ingest tools
    /// ran against hand-authored NDJSON fixtures.
    pub fn validate_soft(&self) -> Result<(), String> {
        if self.chunk_id.0.trim().is_empty() {
            return Err("chunk_id must not be empty".into());
        }
        if self.collection.0.trim().is_empty() {
            return Err("collection must not be empty".into());
        }
        if self.text.trim().is_empty() {
            return Err("text must not be empty".into());
        }
        Ok(())
    }
}

/// A dense vector associated 1:1 with a [`Chunk`]. All embeddings within a collection
/// share `(model_id, dimension)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: ChunkId,
    pub model_id: String,
    pub dimension: usize,
    pub vector: Vec<f32>,
}

/// Sidecar record persisted alongside a collection's vector/lexical backing stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: CollectionName,
    pub model_id: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
    pub chunk_count: u64,
    #[serde(default)]
    pub migrated_from: Option<CollectionName>,
}

/// Classification bucket assigned to a query by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Factual,
    Procedural,
    Conceptual,
    Search,
}

impl QueryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::Factual => "factual",
            QueryClass::Procedural => "procedural",
            QueryClass::Conceptual => "conceptual",
            QueryClass::Search => "search",
        }
    }
}

/// Derived per-request plan produced by the query planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query_class: QueryClass,
    pub dense_weight: f32,
    pub lexical_weight: f32,
    pub retrieve_k: usize,
    pub rerank_k: usize,
    pub use_expansion: bool,
    pub use_rerank: bool,
    pub plan_confidence: f32,
}

/// Metadata about a chunk surfaced alongside a retrieval candidate, kept separate from
/// the full [`Chunk`] so hot-path fusion code isn't cloning text repeatedly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    pub doc_title: String,
    pub section_title: String,
    pub page: Option<u32>,
}

/// A candidate surfaced by the retriever, scored on [0, 1] and fused across dense and
/// lexical retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: ChunkId,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub dense_score: Option<f32>,
    pub lexical_score: Option<f32>,
    pub fused_score: f32,
}

/// Key identifying one `(query, chunk)` rerank score in the rerank cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RerankKey {
    pub query_fingerprint: String,
    pub chunk_id: ChunkId,
}

/// A citation referencing a chunk that appeared in the candidate set shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source_index: u32,
    pub chunk_id: ChunkId,
}

/// Per-stage timings for one request, surfaced alongside the answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    pub admission_ms: u64,
    pub planning_ms: u64,
    pub embed_query_ms: u64,
    pub retrieval_ms: u64,
    pub rerank_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

/// Final answer produced by the Answerer, or a structured refusal / partial result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub confidence: f32,
    pub token_count: usize,
    pub latency: LatencyBreakdown,
    pub deadline_exceeded: bool,
    pub search_strategy: String,
}

/// Static quota plus live counters tracked per client by the admission controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientQuota {
    pub client_id: String,
    pub rpm: u32,
    pub rph: u32,
    pub max_concurrent: u32,
    pub burst: u32,
    pub scopes: Vec<String>,
    pub active: bool,
}

impl ClientQuota {
    pub fn unlimited(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            rpm: u32::MAX,
            rph: u32::MAX,
            max_concurrent: u32::MAX,
            burst: u32::MAX,
            scopes: vec!["ingest".into(), "query".into(), "admin".into()],
            active: true,
        }
    }
}
