//! Wires every other crate in the workspace into one `HybridService`: ingest
//! (§4.6–§4.9) chunks files through [`file_chunker`], embeds and admits them through
//! [`chunking_store::orchestrator::Indexer`]; query (§4.14) runs one request through
//! admission control, the query planner, the retriever, the reranker, and the
//! answerer, all under a single wall-clock deadline via [`pipeline::Deadline`].
//!
//! The primary store ([`chunking_store::sqlite_repo::SqliteRepo`]), lexical index
//! ([`chunking_store::tantivy_index::TantivyTextIndex`]), and vector index
//! ([`chunking_store::hnsw_index::HnswVectorIndex`]) are concrete, in-process
//! adapters; the embedder, cross-encoder, and LLM are narrow traits supplied by the
//! caller, since those really are out-of-scope external collaborators (§1).

pub mod answerer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod retriever;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use chunk_model::{
    Answer, ChunkId, Citation, ClientQuota, CollectionInfo, CollectionName, LatencyBreakdown,
    QueryClass, QueryPlan, RetrievalCandidate, SpanStatus,
};
use chunking_store::hnsw_index::HnswVectorIndex;
use chunking_store::orchestrator::Indexer;
use chunking_store::sqlite_repo::SqliteRepo;
use chunking_store::tantivy_index::TantivyTextIndex;
use chunking_store::{ChunkStoreRead, FilterClause, TextIndexMaintainer, TextSearcher, VectorIndexMaintainer, VectorSearcher};
use embedding_provider::{EmbeddingClient, Embedder};
use file_chunker::text_segmenter::ChunkParams;
use reranker::{CrossEncoder, Reranker};

use crate::answerer::{Answerer, LlmClient, StreamEvent};
use crate::config::Config;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::pipeline::{Deadline, QueryRequest, QueryResponse, Trace};

/// Default capacity for the in-process cache families; a remote cache server would
/// size these instead, but for one process this is generous relative to the number
/// of distinct `(query, collection)` pairs any single deployment sees in a TTL window.
const CACHE_CAPACITY: u64 = 50_000;

/// Result of one ingest call (§6 `POST /ingest`): per-file failures are collected
/// rather than aborting the whole batch.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestOutcome {
    pub documents_processed: usize,
    pub chunks_created: usize,
    pub duplicates_skipped: usize,
    pub errors: Vec<String>,
}

/// Result of a `reindex_source` call: the documents removed, plus the outcome of
/// re-ingesting the replacement content.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReindexOutcome {
    pub deleted_documents: usize,
    pub ingest: IngestOutcome,
}

/// §6 `GET /collections/{collection}` response shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectionInfoView {
    pub chunk_count: u64,
    pub dimension: usize,
    pub model_id: String,
    pub status: String,
}

/// The assembled service: one primary store, one pair of indexes, and the
/// pipeline stages that read/write them.
pub struct HybridService {
    cfg: Config,
    repo: Arc<SqliteRepo>,
    indexer: Arc<Indexer>,
    embedder: EmbeddingClient,
    retriever: retriever::Retriever,
    reranker: Reranker,
    answerer: Answerer,
    admission: admission_control::AdmissionController,
    metrics: Metrics,
    vector_cache: cache::TypedCache<Vec<RetrievalCandidate>>,
}

impl HybridService {
    /// Build a service over `data_dir` (or an in-memory store when `None`, useful
    /// for tests), wiring the caller-supplied embedder/LLM/cross-encoder adapters
    /// (§1's out-of-scope collaborators) into the pipeline stages.
    pub fn new(
        cfg: Config,
        data_dir: Option<&Path>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        cross_encoder: Option<Arc<dyn CrossEncoder>>,
    ) -> Result<Self, PipelineError> {
        cfg.validate()?;

        let repo = Arc::new(match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| PipelineError::Internal(format!("creating data dir: {e}")))?;
                SqliteRepo::open(dir.join("chunks.sqlite3"))?
            }
            None => SqliteRepo::open_in_memory()?,
        });
        let text_index = Arc::new(TantivyTextIndex::new());
        let vector_index = Arc::new(HnswVectorIndex::new());

        // `Indexer::new` rehydrates the lexical/vector indexes from `repo` for every
        // collection already on disk, so a restart against a persisted `data_dir`
        // doesn't come up with empty indexes and a dedup registry that silently
        // swallows every subsequent ingest as a duplicate.
        let indexer = Arc::new(Indexer::new(
            repo.clone(),
            text_index.clone() as Arc<dyn TextIndexMaintainer + Send + Sync>,
            vector_index.clone() as Arc<dyn VectorIndexMaintainer + Send + Sync>,
        )?);

        let retriever = retriever::Retriever::new(
            repo.clone() as Arc<dyn ChunkStoreRead + Send + Sync>,
            vector_index as Arc<dyn VectorSearcher + Send + Sync>,
            text_index as Arc<dyn TextSearcher + Send + Sync>,
        );

        let rerank_cache = cache::TypedCache::new("rerank_score", Duration::from_secs(cfg.rerank_cache_ttl_secs), CACHE_CAPACITY);
        let answer_cache = cache::TypedCache::new("answer", Duration::from_secs(cfg.answer_cache_ttl_secs), CACHE_CAPACITY);
        let vector_cache = cache::TypedCache::new("vector_hits", Duration::from_secs(cfg.vector_cache_ttl_secs), CACHE_CAPACITY);

        let reranker = Reranker::new(cross_encoder, rerank_cache);
        let answerer = Answerer::new(llm, answer_cache);
        let admission = admission_control::AdmissionController::with_config(cfg.global_capacity, cfg.max_queue_depth, cfg.overload_threshold);
        let embedder = EmbeddingClient::new(embedder, cfg.embedding_batch_size);

        Ok(Self {
            cfg,
            repo,
            indexer,
            embedder,
            retriever,
            reranker,
            answerer,
            admission,
            metrics: Metrics::new(),
            vector_cache,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Register or update a client's rate/concurrency quota (§6 admin surface).
    /// A client with no registered quota is treated as unlimited, per
    /// [`ClientQuota::unlimited`].
    pub fn register_client(&self, quota: ClientQuota) {
        self.admission.set_quota(quota);
    }

    pub fn remove_client(&self, client_id: &str) {
        self.admission.remove_quota(client_id);
    }

    /// Best-effort liveness check: the primary store is always in-process, so this
    /// only fails if the SQLite connection itself is broken.
    pub fn health(&self) -> bool {
        self.repo.counts(&CollectionName::from("__health_check__")).is_ok()
    }

    fn ensure_collection(&self, collection: &CollectionName) -> Result<(), PipelineError> {
        let info = self.embedder.info();
        match self.repo.collection_info(collection)? {
            Some(existing) if existing.chunk_count > 0 => {
                if existing.model_id != info.embedding_model_id || existing.dimension != info.dimension {
                    return Err(PipelineError::Validation(format!(
                        "collection {collection} is bound to model {} (dim {}); cannot ingest with model {} (dim {})",
                        existing.model_id, existing.dimension, info.embedding_model_id, info.dimension
                    )));
                }
            }
            _ => {
                self.repo.upsert_collection_info(&CollectionInfo {
                    name: collection.clone(),
                    model_id: info.embedding_model_id.clone(),
                    dimension: info.dimension,
                    created_at: Utc::now(),
                    chunk_count: 0,
                    migrated_from: None,
                })?;
            }
        }
        Ok(())
    }

    fn refresh_collection_count(&self, collection: &CollectionName) -> Result<(), PipelineError> {
        let count = self.repo.counts(collection)?;
        if let Some(mut info) = self.repo.collection_info(collection)? {
            info.chunk_count = count;
            self.repo.upsert_collection_info(&info)?;
        }
        Ok(())
    }

    /// Chunk, embed, and admit `files` (each a `(path, logical source name)` pair)
    /// into `collection`. One file's chunker/embedder failure is recorded in
    /// `errors` rather than aborting the rest (§6's per-item ingest semantics).
    pub async fn ingest_files(
        &self,
        collection: &str,
        files: &[(PathBuf, String)],
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<IngestOutcome, PipelineError> {
        let collection = CollectionName::from(collection);
        self.ensure_collection(&collection)?;
        let params = ChunkParams { chunk_size, chunk_overlap };

        let mut outcome = IngestOutcome::default();
        for (path, source) in files {
            match self.ingest_one_file(&collection, path, source, params).await {
                Ok((created, duplicates)) => {
                    outcome.documents_processed += 1;
                    outcome.chunks_created += created;
                    outcome.duplicates_skipped += duplicates;
                }
                Err(err) => {
                    tracing::warn!(source, error = %err, "ingest failed for one file");
                    outcome.errors.push(format!("{source}: {err}"));
                }
            }
        }
        self.refresh_collection_count(&collection)?;
        self.vector_cache.invalidate_tag(&cache::collection_tag(&collection.0)).await;
        Ok(outcome)
    }

    async fn ingest_one_file(
        &self,
        collection: &CollectionName,
        path: &Path,
        source: &str,
        params: ChunkParams,
    ) -> Result<(usize, usize), PipelineError> {
        let chunks = file_chunker::chunk_file(path, collection, source, params)?;
        if chunks.is_empty() {
            return Ok((0, 0));
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        let dim = self.embedder.info().dimension;
        let paired: Vec<(ChunkId, Vec<f32>)> = chunks.iter().map(|c| c.chunk_id.clone()).zip(vectors).collect();

        let report = self.indexer.upsert(collection, chunks, paired, dim)?;
        self.metrics.record_dedup((report.admitted + report.duplicates) as u64, report.duplicates as u64);
        Ok((report.admitted, report.duplicates))
    }

    pub async fn delete_by_source(&self, collection: &str, source: &str) -> Result<usize, PipelineError> {
        let collection = CollectionName::from(collection);
        let report = self.indexer.delete_by_source(&collection, source)?;
        self.refresh_collection_count(&collection)?;
        self.vector_cache.invalidate_tag(&cache::collection_tag(&collection.0)).await;
        Ok(report.deleted)
    }

    pub async fn delete_by_filter(&self, collection: &str, filters: &[FilterClause], batch_size: usize) -> Result<usize, PipelineError> {
        let collection = CollectionName::from(collection);
        let report = self.indexer.delete_by_filter(&collection, filters, batch_size)?;
        self.refresh_collection_count(&collection)?;
        self.vector_cache.invalidate_tag(&cache::collection_tag(&collection.0)).await;
        Ok(report.deleted)
    }

    /// §4.8's `reindex_source`: replace every chunk for `source` with freshly
    /// chunked content from `files`. This composes [`Indexer::delete_by_source`]
    /// with a normal ingest rather than calling the lower-level
    /// `Indexer::reindex_source`, which only rebuilds the lexical/vector index from
    /// chunk text already in the primary store — not what "reindex" means at this
    /// layer when the source content itself has changed.
    pub async fn reindex_source(
        &self,
        collection: &str,
        source: &str,
        files: &[(PathBuf, String)],
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<ReindexOutcome, PipelineError> {
        let deleted_documents = self.delete_by_source(collection, source).await?;
        let ingest = self.ingest_files(collection, files, chunk_size, chunk_overlap).await?;
        Ok(ReindexOutcome { deleted_documents, ingest })
    }

    /// Copy every chunk from `from` into `to`, re-embedding with `new_embedder` so a
    /// collection can move to a different embedding model without losing history.
    pub async fn migrate_collection(&self, from: &str, to: &str, new_embedder: Arc<dyn Embedder>) -> Result<usize, PipelineError> {
        let from_name = CollectionName::from(from);
        let to_name = CollectionName::from(to);
        let chunks = self.repo.list_all_chunks(&from_name)?;
        if chunks.is_empty() {
            return Ok(0);
        }

        let client = EmbeddingClient::new(new_embedder, self.cfg.embedding_batch_size);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = client.embed_batch(&texts).await?;
        let dim = client.info().dimension;
        let model_id = client.info().embedding_model_id.clone();
        let paired: Vec<(ChunkId, Vec<f32>)> = chunks.iter().map(|c| c.chunk_id.clone()).zip(vectors).collect();

        let migrated = self.indexer.migrate_collection(&from_name, &to_name, &model_id, dim, &paired)?;
        self.refresh_collection_count(&to_name)?;
        Ok(migrated)
    }

    pub fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfoView>, PipelineError> {
        let name = CollectionName::from(collection);
        let info = self.repo.collection_info(&name)?;
        Ok(info.map(|i| CollectionInfoView {
            chunk_count: i.chunk_count,
            dimension: i.dimension,
            model_id: i.model_id,
            status: "ready".to_string(),
        }))
    }

    fn resolve_plan(&self, request: &QueryRequest) -> QueryPlan {
        let mut plan = if request.use_planning {
            query_planner::plan(&request.question)
        } else {
            default_plan()
        };
        plan.use_rerank &= request.use_reranking;
        plan.use_expansion &= request.use_query_expansion;
        if !request.use_hybrid {
            plan.dense_weight = 1.0;
            plan.lexical_weight = 0.0;
        }
        if let Some(top_k) = request.top_k {
            plan.rerank_k = top_k.max(1);
            plan.retrieve_k = plan.retrieve_k.max(plan.rerank_k);
        }
        plan
    }

    /// §4.14 Pipeline Orchestrator: admission → planning → embed query →
    /// retrieval → rerank → answer, each stage timed against the request's total
    /// deadline. A stage that times out short-circuits to a partial, marked
    /// `deadline_exceeded=true`, rather than failing the request.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, PipelineError> {
        let start = Instant::now();
        let deadline = Deadline::after(Duration::from_millis(self.cfg.request_deadline_ms));
        let mut trace = Trace::new();
        let mut latency = LatencyBreakdown::default();

        let mut admission_span = trace.start("admission");
        admission_span.tag("client_id", request.client_id.clone());
        let admit_start = Instant::now();
        let ticket = match self.admission.admit(&request.client_id, &request.scope) {
            Ok(ticket) => ticket,
            Err(denial) => {
                self.metrics.record_denied(denial.reason());
                trace.finish(admission_span, SpanStatus::Error);
                return Err(PipelineError::from_denial(&denial));
            }
        };
        self.metrics.record_admitted();
        latency.admission_ms = admit_start.elapsed().as_millis() as u64;
        trace.finish(admission_span, SpanStatus::Ok);

        let collection = CollectionName::from(request.collection.clone());

        let planning_span = trace.start("planning");
        let plan_start = Instant::now();
        let plan = self.resolve_plan(&request);
        latency.planning_ms = plan_start.elapsed().as_millis() as u64;
        trace.finish(planning_span, SpanStatus::Ok);

        if deadline.is_expired() {
            ticket.release();
            return Ok(deadline_exceeded_response(plan, Vec::new(), start, latency, trace));
        }

        let fingerprint = chunk_model::fingerprint::query_fingerprint(&request.question, &collection, &request.filters);

        let embed_span = trace.start("embed_query");
        let embed_start = Instant::now();
        let query_vector = match tokio::time::timeout(deadline.remaining(), self.embedder.embed_query(&request.question)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(err)) => {
                trace.finish(embed_span, SpanStatus::Error);
                ticket.release();
                return Err(PipelineError::Embedding(err));
            }
            Err(_) => {
                trace.finish(embed_span, SpanStatus::DeadlineExceeded);
                ticket.release();
                return Ok(deadline_exceeded_response(plan, Vec::new(), start, latency, trace));
            }
        };
        latency.embed_query_ms = embed_start.elapsed().as_millis() as u64;
        trace.finish(embed_span, SpanStatus::Ok);

        let mut retrieval_span = trace.start("retrieval");
        let retrieval_start = Instant::now();
        let cache_key = format!("{}:{fingerprint}", collection.0);
        let (mut candidates, lexical_unavailable) = if let Some(cached) = self.vector_cache.get(&cache_key).await {
            self.metrics.record_cache("vector_hits", true);
            (cached, false)
        } else {
            self.metrics.record_cache("vector_hits", false);
            match tokio::time::timeout(deadline.remaining(), self.retriever.retrieve(&collection, &request.question, &query_vector, &plan)).await {
                Ok(Ok(outcome)) => {
                    self.metrics.record_retrieval_fanout(outcome.candidates.len(), outcome.candidates.len());
                    self.vector_cache.set(cache_key, outcome.candidates.clone(), cache::collection_tag(&collection.0), None).await;
                    (outcome.candidates, outcome.lexical_unavailable)
                }
                Ok(Err(err)) => {
                    trace.finish(retrieval_span, SpanStatus::Error);
                    ticket.release();
                    return Err(PipelineError::from(err));
                }
                Err(_) => {
                    trace.finish(retrieval_span, SpanStatus::DeadlineExceeded);
                    ticket.release();
                    return Ok(deadline_exceeded_response(plan, Vec::new(), start, latency, trace));
                }
            }
        };
        if lexical_unavailable {
            retrieval_span.tag("lexical", "unavailable");
            tracing::warn!(collection = %collection.0, "query served with lexical retrieval unavailable");
        }
        latency.retrieval_ms = retrieval_start.elapsed().as_millis() as u64;
        trace.finish(retrieval_span, SpanStatus::Ok);

        if candidates.is_empty() {
            ticket.release();
            let answer = no_sources_refusal(&plan);
            let (trace_id, spans) = (trace.trace_id().to_string(), trace.into_spans());
            return Ok(QueryResponse::from_answer(answer, plan, &candidates, start.elapsed().as_secs_f64(), trace_id, spans));
        }

        if deadline.is_expired() {
            candidates.truncate(plan.rerank_k);
            ticket.release();
            return Ok(deadline_exceeded_response(plan, candidates, start, latency, trace));
        }

        let rerank_span = trace.start("rerank");
        let rerank_start = Instant::now();
        candidates = if plan.use_rerank {
            self.reranker.rerank(&request.question, &fingerprint, &collection.0, candidates, plan.rerank_k, None).await
        } else {
            candidates.truncate(plan.rerank_k);
            candidates
        };
        latency.rerank_ms = rerank_start.elapsed().as_millis() as u64;
        trace.finish(rerank_span, SpanStatus::Ok);

        if deadline.is_expired() {
            ticket.release();
            return Ok(deadline_exceeded_response(plan, candidates, start, latency, trace));
        }

        let answer_span = trace.start("answer");
        let answer_start = Instant::now();
        let mut answer = if let Some(cached) = self.answerer.cached_answer(&fingerprint).await {
            self.metrics.record_cache("answer", true);
            cached
        } else {
            self.metrics.record_cache("answer", false);
            let generate = self.answerer.answer(
                &request.question,
                &candidates,
                &plan,
                self.cfg.max_tokens,
                self.cfg.max_context_tokens,
                self.cfg.require_citations,
                self.cfg.forbid_unverifiable,
                self.cfg.low_confidence_floor,
            );
            match tokio::time::timeout(deadline.remaining(), generate).await {
                Ok(Ok(answer)) => {
                    self.answerer.cache_answer(&fingerprint, &collection.0, answer.clone(), None).await;
                    answer
                }
                Ok(Err(err)) => {
                    trace.finish(answer_span, SpanStatus::Error);
                    ticket.release();
                    return Err(PipelineError::Answerer(err));
                }
                Err(_) => {
                    trace.finish(answer_span, SpanStatus::DeadlineExceeded);
                    ticket.release();
                    return Ok(deadline_exceeded_response(plan, candidates, start, latency, trace));
                }
            }
        };
        latency.generation_ms = answer_start.elapsed().as_millis() as u64;
        latency.total_ms = start.elapsed().as_millis() as u64;
        answer.latency = latency;
        trace.finish(answer_span, SpanStatus::Ok);
        ticket.release();

        let (trace_id, spans) = (trace.trace_id().to_string(), trace.into_spans());
        Ok(QueryResponse::from_answer(answer, plan, &candidates, start.elapsed().as_secs_f64(), trace_id, spans))
    }

    /// Streaming variant of [`query`](Self::query): runs admission, planning,
    /// retrieval, and reranking synchronously, then forwards generation to
    /// [`Answerer::answer_stream`] for token-by-token delivery.
    pub async fn query_stream(&self, request: QueryRequest) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, PipelineError> {
        let ticket = self.admission.admit(&request.client_id, &request.scope).map_err(|denial| {
            self.metrics.record_denied(denial.reason());
            PipelineError::from_denial(&denial)
        })?;
        self.metrics.record_admitted();

        let collection = CollectionName::from(request.collection.clone());
        let plan = self.resolve_plan(&request);

        let query_vector = self.embedder.embed_query(&request.question).await?;
        let outcome = self.retriever.retrieve(&collection, &request.question, &query_vector, &plan).await?;

        let fingerprint = chunk_model::fingerprint::query_fingerprint(&request.question, &collection, &request.filters);
        let candidates = if plan.use_rerank {
            self.reranker.rerank(&request.question, &fingerprint, &collection.0, outcome.candidates, plan.rerank_k, None).await
        } else {
            let mut c = outcome.candidates;
            c.truncate(plan.rerank_k);
            c
        };

        let rx = self
            .answerer
            .answer_stream(
                &request.question,
                &candidates,
                &plan,
                self.cfg.max_tokens,
                self.cfg.max_context_tokens,
                self.cfg.require_citations,
                self.cfg.forbid_unverifiable,
                self.cfg.low_confidence_floor,
            )
            .await?;
        ticket.release();
        Ok(rx)
    }

    /// Run a batch of independent query requests, preserving input order in the
    /// output. Requests are processed one at a time rather than fanned out
    /// concurrently, since each already shares the single admission controller and
    /// cache instances — concurrency is the orchestrator's job at the (excluded)
    /// HTTP layer, not this method's.
    pub async fn query_batch(&self, requests: Vec<QueryRequest>) -> Vec<Result<QueryResponse, PipelineError>> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.query(request).await);
        }
        out
    }
}

/// Plan used when a request opts out of planning (`use_planning=false`): a neutral
/// 50/50 split with conservative stage budgets, rather than skipping retrieval
/// weighting entirely.
fn default_plan() -> QueryPlan {
    QueryPlan {
        query_class: QueryClass::Factual,
        dense_weight: 0.5,
        lexical_weight: 0.5,
        retrieve_k: 10,
        rerank_k: 5,
        use_expansion: false,
        use_rerank: true,
        plan_confidence: 0.5,
    }
}

fn no_sources_refusal(plan: &QueryPlan) -> Answer {
    Answer {
        text: "I don't have enough information in the available sources to answer this question.".to_string(),
        citations: Vec::new(),
        confidence: 0.0,
        token_count: 0,
        latency: LatencyBreakdown::default(),
        deadline_exceeded: false,
        search_strategy: plan.query_class.as_str().to_string(),
    }
}

fn deadline_exceeded_response(
    plan: QueryPlan,
    candidates: Vec<RetrievalCandidate>,
    start: Instant,
    mut latency: LatencyBreakdown,
    trace: Trace,
) -> QueryResponse {
    latency.total_ms = start.elapsed().as_millis() as u64;
    let confidence = candidates.first().map(|c| c.fused_score * 0.5).unwrap_or(0.0);
    let citations: Vec<Citation> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| Citation { source_index: i as u32 + 1, chunk_id: c.chunk_id.clone() })
        .collect();
    let answer = Answer {
        text: "The request exceeded its time budget before a full answer could be generated; partial sources are included below.".to_string(),
        citations,
        confidence,
        token_count: 0,
        latency,
        deadline_exceeded: true,
        search_strategy: plan.query_class.as_str().to_string(),
    };
    let (trace_id, spans) = (trace.trace_id().to_string(), trace.into_spans());
    QueryResponse::from_answer(answer, plan, &candidates, start.elapsed().as_secs_f64(), trace_id, spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answerer::EchoLlmClient;
    use embedding_provider::embedder::{EmbedderError, EmbedderInfo, ProviderKind};

    struct FixedEmbedder {
        info: EmbedderInfo,
    }

    impl Embedder for FixedEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            let seed = text.len() as f32;
            Ok(vec![seed; self.info.dimension])
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            texts.iter().map(|t| self.embed(t)).collect()
        }

        fn info(&self) -> &EmbedderInfo {
            &self.info
        }
    }

    fn test_embedder() -> Arc<dyn Embedder> {
        Arc::new(FixedEmbedder {
            info: EmbedderInfo {
                provider: ProviderKind::OnnxStdIo,
                embedding_model_id: "test-embedder".into(),
                dimension: 8,
                text_repr_version: "v1".into(),
            },
        })
    }

    fn test_service() -> HybridService {
        HybridService::new(Config::default(), None, test_embedder(), Arc::new(EchoLlmClient), None).unwrap()
    }

    #[tokio::test]
    async fn ingest_then_query_returns_a_grounded_answer() {
        let svc = test_service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# Intro\n\nRust is a systems programming language focused on safety and speed.\n").unwrap();

        let outcome = svc.ingest_files("docs", &[(path, "doc.md".to_string())], 400, 50).await.unwrap();
        assert_eq!(outcome.documents_processed, 1);
        assert!(outcome.chunks_created >= 1);
        assert!(outcome.errors.is_empty());

        let info = svc.collection_info("docs").unwrap().unwrap();
        assert_eq!(info.chunk_count as usize, outcome.chunks_created);

        let mut request = QueryRequest::new("What is Rust?", "docs", "client-a");
        request.use_reranking = false;
        let response = svc.query(request).await.unwrap();
        assert!(!response.answer.is_empty());
        assert!(!response.deadline_exceeded);
    }

    #[tokio::test]
    async fn reingesting_identical_content_is_deduplicated() {
        let svc = test_service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# Intro\n\nDuplicate detection keeps the index from growing unbounded.\n").unwrap();

        let first = svc.ingest_files("docs", &[(path.clone(), "doc.md".to_string())], 400, 50).await.unwrap();
        let second = svc.ingest_files("docs", &[(path, "doc.md".to_string())], 400, 50).await.unwrap();

        assert!(first.chunks_created >= 1);
        assert_eq!(second.chunks_created, 0);
        assert_eq!(second.duplicates_skipped, first.chunks_created);
    }

    #[tokio::test]
    async fn querying_an_empty_collection_returns_a_refusal_not_an_error() {
        let svc = test_service();
        let request = QueryRequest::new("anything", "empty-collection", "client-a");
        let response = svc.query(request).await.unwrap();
        assert!(response.sources.is_empty());
        assert!(response.confidence <= 0.01);
    }

    #[tokio::test]
    async fn admission_denial_surfaces_as_a_pipeline_error() {
        let svc = test_service();
        svc.register_client(ClientQuota {
            client_id: "limited".into(),
            rpm: 0,
            rph: u32::MAX,
            max_concurrent: u32::MAX,
            burst: u32::MAX,
            scopes: vec!["query".into()],
            active: true,
        });
        let request = QueryRequest::new("hello", "docs", "limited");
        let err = svc.query(request).await.unwrap_err();
        assert_eq!(err.kind(), error::ErrorKind::Admission);
    }

    #[tokio::test]
    async fn reindex_source_replaces_prior_content_for_that_source() {
        let svc = test_service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# A\n\nOriginal content about apples.\n").unwrap();
        svc.ingest_files("docs", &[(path, "doc.md".to_string())], 400, 50).await.unwrap();

        let path2 = dir.path().join("doc2.md");
        std::fs::write(&path2, "# A\n\nReplacement content about oranges.\n").unwrap();
        let outcome = svc.reindex_source("docs", "doc.md", &[(path2, "doc.md".to_string())], 400, 50).await.unwrap();
        assert!(outcome.deleted_documents >= 1);
        assert!(outcome.ingest.chunks_created >= 1);
    }
}
