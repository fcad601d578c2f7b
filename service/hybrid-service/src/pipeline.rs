//! §4.14 Pipeline Orchestrator: sequences Admission → Planner → embed query →
//! Retriever → Reranker → Answerer for one query, wrapping each stage in a [`Span`]
//! and a timeout carved out of the request's total deadline (§5). On deadline
//! exceeded, downstream stages are skipped and the best partial result is returned
//! with `deadline_exceeded=true` rather than failing the request outright.

use std::collections::BTreeMap;
use std::time::Duration;

use chunk_model::{Answer, QueryPlan, Span, SpanStatus};
use tokio::time::Instant as TokioInstant;

/// One request's wall-clock budget (§5). Each stage asks for however much is left
/// when it begins; `tokio::time::timeout` enforces it against the stage's future.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: TokioInstant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self { at: TokioInstant::now() + duration }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(TokioInstant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Generates span/trace ids without pulling in a random-number source: a
/// process-local counter folded with the current time is unique enough for a
/// correlation id that never needs to be unguessable, unlike e.g. `api_key`.
fn next_id(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{prefix}-{nanos:x}-{n:x}")
}

pub fn new_trace_id() -> String {
    next_id("trace")
}

fn new_span_id() -> String {
    next_id("span")
}

/// Running record of one request's spans, in the shape §3 and §10 describe: a flat
/// list forming a tree via `parent_id`, returned to the caller alongside the answer
/// for diagnostics (an external trace exporter is out of scope, §1).
pub struct Trace {
    trace_id: String,
    spans: Vec<Span>,
}

impl Trace {
    pub fn new() -> Self {
        Self { trace_id: new_trace_id(), spans: Vec::new() }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Run `op`'s one stage, emitting a span around it. `parent` links the span into
    /// the trace tree; stages in §4.14's sequence are all children of the request
    /// root, so `None` is typical.
    pub fn start(&mut self, op: &str) -> SpanHandle {
        SpanHandle {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            op: op.to_string(),
            start: chrono::Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    pub fn finish(&mut self, handle: SpanHandle, status: SpanStatus) {
        self.spans.push(Span {
            trace_id: handle.trace_id,
            span_id: handle.span_id,
            parent_id: None,
            op: handle.op,
            start: handle.start,
            end: Some(chrono::Utc::now()),
            status: Some(status),
            tags: handle.tags,
            logs: Vec::new(),
        });
    }

    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpanHandle {
    trace_id: String,
    span_id: String,
    op: String,
    start: chrono::DateTime<chrono::Utc>,
    tags: BTreeMap<String, String>,
}

impl SpanHandle {
    pub fn tag(&mut self, key: &str, value: impl Into<String>) {
        self.tags.insert(key.to_string(), value.into());
    }
}

/// One request's input, mirroring §6's `POST /query` body. `client_id`/`scope` stand
/// in for the credential verification that's out of scope (§1): the caller (the
/// excluded HTTP layer) resolves the API key into these before calling in.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    pub collection: String,
    pub client_id: String,
    pub scope: String,
    pub top_k: Option<usize>,
    pub use_hybrid: bool,
    pub use_reranking: bool,
    pub use_query_expansion: bool,
    pub use_planning: bool,
    pub filters: BTreeMap<String, String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>, collection: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            collection: collection.into(),
            client_id: client_id.into(),
            scope: "query".to_string(),
            top_k: None,
            use_hybrid: true,
            use_reranking: true,
            use_query_expansion: true,
            use_planning: true,
            filters: BTreeMap::new(),
        }
    }
}

/// §6's `POST /query` response shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub contexts: Vec<String>,
    pub confidence: f32,
    pub processing_time_seconds: f64,
    pub tokens_used: usize,
    pub latency_breakdown: chunk_model::LatencyBreakdown,
    pub search_strategy: String,
    pub query_plan: QueryPlan,
    pub deadline_exceeded: bool,
    pub trace_id: String,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceRef {
    pub source_index: u32,
    pub chunk_id: String,
    pub source: String,
    pub section_title: String,
    pub page: Option<u32>,
    pub relevance: f32,
}

impl QueryResponse {
    pub fn from_answer(
        answer: Answer,
        plan: QueryPlan,
        candidates: &[chunk_model::RetrievalCandidate],
        processing_time_seconds: f64,
        trace_id: String,
        spans: Vec<Span>,
    ) -> Self {
        let sources = answer
            .citations
            .iter()
            .filter_map(|c| {
                candidates.iter().find(|cand| cand.chunk_id == c.chunk_id).map(|cand| SourceRef {
                    source_index: c.source_index,
                    chunk_id: c.chunk_id.0.clone(),
                    source: cand.metadata.source.clone(),
                    section_title: cand.metadata.section_title.clone(),
                    page: cand.metadata.page,
                    relevance: cand.fused_score,
                })
            })
            .collect();
        let contexts = candidates.iter().map(|c| c.text.clone()).collect();
        Self {
            answer: answer.text,
            sources,
            contexts,
            confidence: answer.confidence,
            processing_time_seconds,
            tokens_used: answer.token_count,
            latency_breakdown: answer.latency,
            search_strategy: answer.search_strategy,
            query_plan: plan,
            deadline_exceeded: answer.deadline_exceeded,
            trace_id,
            spans,
        }
    }
}
