//! §11 Configuration: a single [`Config`] struct layered `defaults -> TOML file ->
//! RAG_-prefixed env vars`, validated once at startup rather than scattered through
//! the pipeline. Deserializing the TOML layer with `serde` (rather than a hand-rolled
//! parser) matches the pack's general preference for `serde` over ad hoc parsing; the
//! layering itself is a small merge function, not a separate crate, since each layer
//! is a plain partial `Config`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

fn default_embedding_model() -> String {
    "onnx-local".to_string()
}

fn default_chunk_size() -> usize {
    400
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_max_query_results() -> usize {
    20
}

fn default_max_tokens() -> usize {
    800
}

fn default_max_context_tokens() -> usize {
    4000
}

fn default_rate_limit_rpm() -> u32 {
    60
}

fn default_rate_limit_rph() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_max_concurrent_requests() -> u32 {
    16
}

fn default_max_queue_depth() -> usize {
    100
}

fn default_overload_threshold() -> f64 {
    0.8
}

fn default_rerank_cache_ttl_secs() -> u64 {
    30 * 60
}

fn default_answer_cache_ttl_secs() -> u64 {
    10 * 60
}

fn default_vector_cache_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_low_confidence_floor() -> f32 {
    0.3
}

/// §5's "total request deadline", the budget the Orchestrator carves into per-stage
/// timeouts. Not itself named in §6's table, but called out as configurable there.
fn default_request_deadline_ms() -> u64 {
    10_000
}

fn default_global_capacity() -> u32 {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Layered service configuration. Every field has a default; a TOML file and
/// `RAG_`-prefixed environment variables can each override a subset, applied in that
/// order, with explicit builder-style overrides (via direct field assignment after
/// [`Config::load`]) applied last by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bearer credential for an upstream embedding/LLM provider. Never logged.
    pub api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub embedding_batch_size: usize,
    pub llm_endpoint: Option<String>,
    pub llm_model: Option<String>,
    /// Credential for the LLM endpoint. Never logged.
    pub llm_api_key: Option<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_query_results: usize,
    pub max_tokens: usize,
    pub max_context_tokens: usize,
    pub require_citations: bool,
    pub forbid_unverifiable: bool,
    /// §15.2 guardrail: confidence below this floor is flagged `low_confidence`
    /// rather than rejected outright.
    pub low_confidence_floor: f32,
    pub rate_limit_rpm: u32,
    pub rate_limit_rph: u32,
    pub rate_limit_burst: u32,
    pub max_concurrent_requests: u32,
    pub max_queue_depth: usize,
    pub overload_threshold: f64,
    pub rerank_cache_ttl_secs: u64,
    pub answer_cache_ttl_secs: u64,
    pub vector_cache_ttl_secs: u64,
    /// Total wall-clock budget for one query request (§4.14, §5); stage timeouts are
    /// carved out of whatever remains when each stage begins.
    pub request_deadline_ms: u64,
    /// Sum of every client's `max_concurrent`, used as the denominator for the
    /// admission controller's `system_overload` check (§4.13 step 5).
    pub global_capacity: u32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            embedding_model: default_embedding_model(),
            embedding_dimension: 384,
            embedding_batch_size: default_embedding_batch_size(),
            llm_endpoint: None,
            llm_model: None,
            llm_api_key: None,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_query_results: default_max_query_results(),
            max_tokens: default_max_tokens(),
            max_context_tokens: default_max_context_tokens(),
            require_citations: default_true(),
            forbid_unverifiable: default_true(),
            low_confidence_floor: default_low_confidence_floor(),
            rate_limit_rpm: default_rate_limit_rpm(),
            rate_limit_rph: default_rate_limit_rph(),
            rate_limit_burst: default_rate_limit_burst(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_queue_depth: default_max_queue_depth(),
            overload_threshold: default_overload_threshold(),
            rerank_cache_ttl_secs: default_rerank_cache_ttl_secs(),
            answer_cache_ttl_secs: default_answer_cache_ttl_secs(),
            vector_cache_ttl_secs: default_vector_cache_ttl_secs(),
            request_deadline_ms: default_request_deadline_ms(),
            global_capacity: default_global_capacity(),
            log_level: default_log_level(),
        }
    }
}

macro_rules! env_override {
    ($cfg:expr, $field:ident) => {
        if let Ok(raw) = std::env::var(concat!("RAG_", stringify!($field))) {
            match raw.parse() {
                Ok(parsed) => $cfg.$field = parsed,
                Err(_) => tracing::warn!(var = concat!("RAG_", stringify!($field)), "ignoring unparseable env override"),
            }
        }
    };
}

macro_rules! env_override_opt {
    ($cfg:expr, $field:ident) => {
        if let Ok(raw) = std::env::var(concat!("RAG_", stringify!($field))) {
            $cfg.$field = Some(raw);
        }
    };
}

impl Config {
    /// Build a `Config` by layering defaults, an optional TOML file, then
    /// `RAG_`-prefixed environment variables, validating the result before returning
    /// it. Callers that need to apply explicit process-level overrides on top should
    /// mutate the returned struct's fields directly and call
    /// [`validate`](Self::validate) again.
    pub fn load(toml_path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut cfg = Config::default();

        if let Some(path) = toml_path {
            if path.exists() {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| PipelineError::Validation(format!("reading config file {}: {e}", path.display())))?;
                let file_cfg: Config = toml::from_str(&text)
                    .map_err(|e| PipelineError::Validation(format!("parsing config file {}: {e}", path.display())))?;
                cfg = file_cfg;
            }
        }

        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        env_override_opt!(self, api_key);
        env_override_opt!(self, llm_endpoint);
        env_override_opt!(self, llm_model);
        env_override_opt!(self, llm_api_key);
        if let Ok(raw) = std::env::var("RAG_embedding_model") {
            self.embedding_model = raw;
        }
        env_override!(self, embedding_dimension);
        env_override!(self, embedding_batch_size);
        env_override!(self, chunk_size);
        env_override!(self, chunk_overlap);
        env_override!(self, max_query_results);
        env_override!(self, max_tokens);
        env_override!(self, max_context_tokens);
        env_override!(self, require_citations);
        env_override!(self, forbid_unverifiable);
        env_override!(self, low_confidence_floor);
        env_override!(self, rate_limit_rpm);
        env_override!(self, rate_limit_rph);
        env_override!(self, rate_limit_burst);
        env_override!(self, max_concurrent_requests);
        env_override!(self, max_queue_depth);
        env_override!(self, overload_threshold);
        env_override!(self, rerank_cache_ttl_secs);
        env_override!(self, answer_cache_ttl_secs);
        env_override!(self, vector_cache_ttl_secs);
        env_override!(self, request_deadline_ms);
        env_override!(self, global_capacity);
        if let Ok(raw) = std::env::var("RAG_log_level") {
            self.log_level = raw;
        }
    }

    /// Startup validation (§11): invalid configuration is a `Validation`-kind error,
    /// never a panic.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_overlap >= self.chunk_size {
            return Err(PipelineError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.overload_threshold) || self.overload_threshold <= 0.0 {
            return Err(PipelineError::Validation(format!(
                "overload_threshold must be in (0, 1], got {}",
                self.overload_threshold
            )));
        }
        if self.embedding_dimension == 0 {
            return Err(PipelineError::Validation("embedding_dimension must be > 0".into()));
        }
        if self.max_context_tokens == 0 || self.max_tokens == 0 {
            return Err(PipelineError::Validation("max_tokens and max_context_tokens must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.low_confidence_floor) {
            return Err(PipelineError::Validation(format!(
                "low_confidence_floor must be in [0, 1], got {}",
                self.low_confidence_floor
            )));
        }
        if self.request_deadline_ms == 0 {
            return Err(PipelineError::Validation("request_deadline_ms must be > 0".into()));
        }
        if self.global_capacity == 0 {
            return Err(PipelineError::Validation("global_capacity must be > 0".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for Config {
    /// Redacted rendering safe to log: secrets are replaced with a fixed placeholder
    /// rather than their value or presence-only boolean, so log scraping can't
    /// distinguish "short key" from "long key".
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| if v.is_some() { "<redacted>" } else { "<unset>" };
        write!(
            f,
            "Config {{ embedding_model: {:?}, embedding_dimension: {}, api_key: {}, llm_endpoint: {:?}, llm_api_key: {}, chunk_size: {}, chunk_overlap: {}, max_tokens: {}, rate_limit_rpm: {} }}",
            self.embedding_model,
            self.embedding_dimension,
            redact(&self.api_key),
            self.llm_endpoint,
            redact(&self.llm_api_key),
            self.chunk_size,
            self.chunk_overlap,
            self.max_tokens,
            self.rate_limit_rpm,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut cfg = Config::default();
        cfg.chunk_overlap = cfg.chunk_size;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overload_threshold_out_of_range_is_rejected() {
        let mut cfg = Config::default();
        cfg.overload_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn display_redacts_secrets() {
        let mut cfg = Config::default();
        cfg.api_key = Some("super-secret".into());
        let rendered = cfg.to_string();
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn toml_file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "chunk_size = 500\nchunk_overlap = 60\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.chunk_overlap, 60);
    }
}
