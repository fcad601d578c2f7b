//! §7/§12: one `thiserror`-derived error enum per crate's own responsibility, composed
//! here via `#[from]` into the single type the orchestrator and (excluded) HTTP layer
//! see. [`ErrorKind`] is the taxonomy that layer maps to status codes, so callers never
//! match on string messages.

use admission_control::Denial;

/// §7's error taxonomy: validation (4xx), admission (429), upstream_unavailable
/// (503/per-item), not_found (404), deadline_exceeded, internal (500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Admission,
    UpstreamUnavailable,
    NotFound,
    DeadlineExceeded,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("admission denied: {reason} (retry after {retry_after_seconds}s)")]
    Admission { reason: String, retry_after_seconds: u64 },
    #[error("chunk store error: {0}")]
    Store(#[from] chunking_store::StoreError),
    #[error("indexer error: {0}")]
    Orchestrator(#[from] chunking_store::orchestrator::OrchestratorError),
    #[error("chunker error: {0}")]
    Chunker(#[from] file_chunker::ChunkerError),
    #[error("embedding provider error: {0}")]
    Embedding(#[from] embedding_provider::EmbeddingClientError),
    #[error("answerer error: {0}")]
    Answerer(#[from] crate::answerer::AnswererError),
    #[error("retriever error: {0}")]
    Retriever(#[from] crate::retriever::RetrieverError),
    #[error("collection not found: {0}")]
    NotFound(String),
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) | PipelineError::Chunker(_) => ErrorKind::Validation,
            PipelineError::Admission { .. } => ErrorKind::Admission,
            PipelineError::Store(_)
            | PipelineError::Orchestrator(_)
            | PipelineError::Embedding(_)
            | PipelineError::Answerer(_)
            | PipelineError::Retriever(_) => ErrorKind::UpstreamUnavailable,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// An admission [`Denial`] is an observable outcome, not an error in the adapter
    /// it came from — this is the one place it's lifted into `PipelineError` for
    /// callers that want a single `Result` to propagate.
    pub fn from_denial(denial: &Denial) -> Self {
        PipelineError::Admission {
            reason: denial.reason().to_string(),
            retry_after_seconds: denial.retry_after_seconds(),
        }
    }
}
