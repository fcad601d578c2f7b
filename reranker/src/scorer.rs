//! Cross-encoder style pairwise scorer: one forward pass per `(query, document)` pair,
//! batched for throughput. Mirrors the ONNX loading/tokenization idiom used for the
//! dense embedder, applied to a sequence-pair classification head instead of a
//! pooled encoder.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::Array2;
use ort::{session::Session, value::Tensor, Error as OrtError};
use thiserror::Error;
use tokenizers::Tokenizer;

#[derive(Debug, Error)]
pub enum RerankerError {
    #[error("invalid reranker configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("reranker provider failure: {message}")]
    ProviderFailure { message: String },
}

/// Pairwise scorer used by the [`crate::Reranker`]. Higher score means more relevant.
pub trait CrossEncoder: Send + Sync {
    fn score_batch(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, RerankerError>;
}

/// Configuration for a local ONNX cross-encoder (e.g. an ms-marco-MiniLM style model).
#[derive(Debug, Clone)]
pub struct OnnxCrossEncoderConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub max_input_length: usize,
}

/// ONNX-backed cross-encoder. One `Session` shared under a lock, matching the teacher's
/// pattern of treating ONNX Runtime sessions as non-reentrant single-writer resources.
pub struct OnnxCrossEncoder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_input_length: usize,
}

impl OnnxCrossEncoder {
    pub fn new(config: OnnxCrossEncoderConfig) -> Result<Self, RerankerError> {
        if config.max_input_length == 0 {
            return Err(RerankerError::InvalidConfiguration {
                message: "max_input_length must be greater than zero".into(),
            });
        }

        let model_path = resolve_existing_path(&config.model_path, "reranker ONNX model")?;
        let tokenizer_path = resolve_existing_path(&config.tokenizer_path, "reranker tokenizer")?;

        let session = Session::builder()
            .map_err(|err| map_ort_error("create session builder", err))?
            .commit_from_file(&model_path)
            .map_err(|err| map_ort_error("load reranker model", err))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|err| map_tokenizer_error("load reranker tokenizer", err))?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            max_input_length: config.max_input_length,
        })
    }
}

impl CrossEncoder for OnnxCrossEncoder {
    fn score_batch(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, RerankerError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = documents
            .iter()
            .map(|doc| self.tokenizer.encode((query, *doc), true))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| map_tokenizer_error("tokenize query/document pairs", err))?;

        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len().min(self.max_input_length))
            .max()
            .unwrap_or(0);
        let batch = encodings.len();

        let mut input_ids = Array2::<i64>::zeros((batch, seq_len));
        let mut attention_mask = Array2::<i64>::zeros((batch, seq_len));
        let mut token_type_ids = Array2::<i64>::zeros((batch, seq_len));

        for (row, enc) in encodings.iter().enumerate() {
            let ids = enc.get_ids();
            let mask = enc.get_attention_mask();
            let types = enc.get_type_ids();
            let len = ids.len().min(seq_len);
            for col in 0..len {
                input_ids[(row, col)] = ids[col] as i64;
                attention_mask[(row, col)] = mask[col] as i64;
                token_type_ids[(row, col)] = types[col] as i64;
            }
        }

        let input_ids = Tensor::from_array(input_ids).map_err(|err| map_ort_error("prepare input_ids", err))?;
        let attention_mask =
            Tensor::from_array(attention_mask).map_err(|err| map_ort_error("prepare attention_mask", err))?;
        let token_type_ids =
            Tensor::from_array(token_type_ids).map_err(|err| map_ort_error("prepare token_type_ids", err))?;

        let mut session = self.session.lock().unwrap();
        let outputs = session
            .run(ort::inputs![input_ids, attention_mask, token_type_ids])
            .map_err(|err| map_ort_error("execute reranker session", err))?;

        let output = &outputs[0];
        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|err| map_ort_error("extract reranker logits", err))?;

        if data.len() != batch {
            return Err(RerankerError::ProviderFailure {
                message: format!(
                    "reranker returned {} scores for a batch of {batch}",
                    data.len()
                ),
            });
        }

        Ok(data.to_vec())
    }
}

fn resolve_existing_path(path: &Path, description: &str) -> Result<PathBuf, RerankerError> {
    fs::metadata(path).map_err(|_| RerankerError::InvalidConfiguration {
        message: format!("{description} `{}` does not exist", path.display()),
    })?;
    path.canonicalize().map_err(|err| RerankerError::ProviderFailure {
        message: format!("failed to canonicalize {description} `{}`: {err}", path.display()),
    })
}

fn map_ort_error(context: &str, err: OrtError) -> RerankerError {
    RerankerError::ProviderFailure {
        message: format!("{context} failed: {err}"),
    }
}

fn map_tokenizer_error(context: &str, err: tokenizers::Error) -> RerankerError {
    RerankerError::ProviderFailure {
        message: format!("{context} failed: {err}"),
    }
}
