//! Semantic Embeddings Module
//!
//! Local embedding generation using fastembed (ONNX-based). No external
//! API calls required for the embedding step itself — only the LLM
//! collaborator (see `llm`) talks to the network.

pub(crate) mod local;

pub use local::{
    cosine_similarity, dot_product, euclidean_distance, matryoshka_truncate, Embedding,
    EmbeddingError, EmbeddingService, BATCH_SIZE, EMBEDDING_DIMENSIONS, MAX_TEXT_LENGTH,
    NATIVE_DIMENSIONS,
};

/// SPEC_FULL.md §6 embedding contract: `encode([text]) -> [vector]` with
/// a dimension constant fixed at construction. `EmbeddingService` is the
/// production implementation (fastembed-backed, local ONNX inference);
/// tests substitute a deterministic fake so recall/dedup/consolidation
/// scenarios run without downloading a model.
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;
    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

impl EmbeddingProvider for EmbeddingService {
    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }

    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.embed_batch(texts)
            .map(|embeddings| embeddings.into_iter().map(|e| e.vector).collect())
    }
}
