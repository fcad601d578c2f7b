//! Embedding providers (§4.2/§4.3): a synchronous [`embedder::Embedder`] trait with
//! ONNX-backed implementations, and an async [`client::EmbeddingClient`] wrapper
//! adding the batching/retry/order-preservation contract the rest of the pipeline
//! depends on.

pub mod client;
pub mod config;
pub mod embedder;

pub use client::{EmbeddingClient, EmbeddingClientError};
pub use embedder::{
    Embedder, EmbedderError, EmbedderInfo, OnnxHttpConfig, OnnxHttpEmbedder, OnnxStdIoConfig,
    OnnxStdIoEmbedder, ProviderKind,
};
