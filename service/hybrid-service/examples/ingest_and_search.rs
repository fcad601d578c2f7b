//! Minimal end-to-end run: ingest one file into a collection, then ask it a
//! question. Uses a deterministic hash-based embedder and the echo LLM stand-in so
//! the example has no external dependencies to run against.

use std::path::PathBuf;
use std::sync::Arc;

use embedding_provider::embedder::{Embedder, EmbedderError, EmbedderInfo, ProviderKind};
use hybrid_service::config::Config;
use hybrid_service::pipeline::QueryRequest;
use hybrid_service::{answerer::EchoLlmClient, HybridService};

const DIM: usize = 32;

/// Stands in for a real ONNX embedder: hashes each word into one of `DIM` buckets
/// so semantically unrelated text lands in different directions, good enough to
/// demonstrate the pipeline without a model file on disk.
struct HashEmbedder {
    info: EmbedderInfo,
}

impl HashEmbedder {
    fn new() -> Self {
        Self {
            info: EmbedderInfo {
                provider: ProviderKind::OnnxStdIo,
                embedding_model_id: "hash-demo".to_string(),
                dimension: DIM,
                text_repr_version: "v1".to_string(),
            },
        }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut vector = vec![0.0f32; DIM];
        for word in text.split_whitespace() {
            let mut hash: u64 = 1469598103934665603;
            for byte in word.as_bytes() {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            vector[(hash as usize) % DIM] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: cargo run -p hybrid-service --example ingest_and_search -- <FILE> <QUERY>");
        std::process::exit(1);
    }
    let file = PathBuf::from(&args[1]);
    let source = args[1].clone();
    let query = args[2].clone();

    let mut cfg = Config::default();
    cfg.embedding_dimension = DIM;
    cfg.validate()?;

    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new());
    let llm = Arc::new(EchoLlmClient);
    let svc = HybridService::new(cfg, None, embedder, llm, None)?;

    let outcome = svc.ingest_files("demo", &[(file, source)], 400, 50).await?;
    println!(
        "ingested {} document(s), {} chunk(s) created, {} duplicate(s), {} error(s)",
        outcome.documents_processed, outcome.chunks_created, outcome.duplicates_skipped, outcome.errors.len()
    );
    for err in &outcome.errors {
        eprintln!("  error: {err}");
    }

    let request = QueryRequest::new(query, "demo", "example-cli");
    let response = svc.query(request).await?;
    println!("\nanswer ({} source(s), confidence {:.2}):", response.sources.len(), response.confidence);
    println!("{}", response.answer);
    for source in &response.sources {
        println!("  [{}] {} ({})", source.source_index, source.source, source.chunk_id);
    }
    Ok(())
}
