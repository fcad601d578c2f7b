//! Async wrapper around [`crate::embedder::Embedder`] implementing §4.3's contract:
//! input order is preserved, requests are capped to a configured batch size, and
//! transient provider failures are retried with exponential backoff before
//! surfacing [`EmbeddingClientError::ProviderUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::embedder::{Embedder, EmbedderError};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    #[error("embedder misconfigured: {0}")]
    InvalidConfiguration(String),
    #[error("input too long: {0}")]
    InputTooLong(String),
    #[error("embedding provider unavailable after {attempts} attempts: {source}")]
    ProviderUnavailable { attempts: u32, source: EmbedderError },
}

impl From<EmbedderError> for EmbeddingClientError {
    fn from(err: EmbedderError) -> Self {
        match err {
            EmbedderError::InvalidConfiguration { message } => {
                EmbeddingClientError::InvalidConfiguration(message)
            }
            EmbedderError::InputTooLong { max_length, actual_length } => {
                EmbeddingClientError::InputTooLong(format!(
                    "max {max_length} tokens, got {actual_length}"
                ))
            }
            // Reached only if a caller surfaces a raw provider failure without going
            // through retry_batch; normal failures are turned into ProviderUnavailable.
            EmbedderError::ProviderFailure { .. } => {
                EmbeddingClientError::ProviderUnavailable { attempts: 1, source: err }
            }
        }
    }
}

/// Async facade over a batching-capable [`Embedder`], adding retry and a hard batch
/// size cap so one oversized request can't monopolize the provider.
#[derive(Clone)]
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self { embedder, batch_size: batch_size.max(1) }
    }

    pub fn info(&self) -> &crate::embedder::EmbedderInfo {
        self.embedder.info()
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        let embedder = self.embedder.clone();
        let text = text.to_string();
        retry(move || embedder.embed(&text)).await
    }

    /// Embed `texts` in batch-size-capped chunks, preserving input order across
    /// chunk boundaries.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let embedder = self.embedder.clone();
            let owned: Vec<String> = chunk.to_vec();
            let vectors = retry(move || {
                let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
                embedder.embed_batch(&refs)
            })
            .await?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Run `op` up to [`MAX_ATTEMPTS`] times, doubling the backoff after each transient
/// ([`EmbedderError::ProviderFailure`]) failure. Configuration and input-length
/// errors are not transient and are returned immediately without retrying.
async fn retry<F, T>(mut op: F) -> Result<T, EmbeddingClientError>
where
    F: FnMut() -> Result<T, EmbedderError>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(EmbedderError::ProviderFailure { message }) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(EmbeddingClientError::ProviderUnavailable {
                        attempts: attempt,
                        source: EmbedderError::ProviderFailure { message },
                    });
                }
                tracing::warn!(attempt, %message, "embedding provider call failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(other) => return Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::EmbedderInfo;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyEmbedder {
        info: EmbedderInfo,
        failures_remaining: AtomicU32,
    }

    impl Embedder for FlakyEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(EmbedderError::ProviderFailure { message: "down".into() });
            }
            Ok(vec![1.0; self.info.dimension])
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            texts.iter().map(|t| self.embed(t)).collect()
        }

        fn info(&self) -> &EmbedderInfo {
            &self.info
        }
    }

    fn info() -> EmbedderInfo {
        EmbedderInfo {
            provider: crate::embedder::ProviderKind::OnnxHttp,
            embedding_model_id: "test".into(),
            dimension: 4,
            text_repr_version: "v1".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_attempt_budget() {
        let embedder = Arc::new(FlakyEmbedder { info: info(), failures_remaining: AtomicU32::new(2) });
        let client = EmbeddingClient::new(embedder, 8);
        let vector = client.embed_query("hello").await.unwrap();
        assert_eq!(vector.len(), 4);
    }

    #[tokio::test]
    async fn surfaces_provider_unavailable_after_exhausting_attempts() {
        let embedder = Arc::new(FlakyEmbedder { info: info(), failures_remaining: AtomicU32::new(10) });
        let client = EmbeddingClient::new(embedder, 8);
        let err = client.embed_query("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingClientError::ProviderUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn embed_batch_preserves_order_across_batch_boundaries() {
        let embedder = Arc::new(FlakyEmbedder { info: info(), failures_remaining: AtomicU32::new(0) });
        let client = EmbeddingClient::new(embedder, 2);
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let vectors = client.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let embedder = Arc::new(FlakyEmbedder { info: info(), failures_remaining: AtomicU32::new(0) });
        let client = EmbeddingClient::new(embedder, 2);
        let vectors = client.embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
