//! # Hindsight Engine
//!
//! Long-term memory substrate for conversational agents: retain,
//! consolidate, recall.
//!
//! A caller `retain`s raw conversation turns or documents; the engine
//! extracts discrete facts (`memory::MemoryUnit`), embeds and
//! deduplicates them, and stores them scoped to a `bank` (one agent's
//! memory store) and a tag set. A background `consolidation` pass
//! periodically folds tag-isolated groups of facts into durable
//! `observation`s via a judge LLM. Reads go through a hybrid `search`
//! pipeline — dense vector similarity, sparse FTS5/BM25, and temporal
//! recency, fused, reranked, and clustered for diversity — or through
//! `reflection`, which runs that same recall and asks the memory LLM
//! to synthesize a grounded answer.
//!
//! See `SPEC_FULL.md` in the repository root for the full design.
//!
//! ## Feature flags
//!
//! - `bundled-sqlite` (default): link SQLite from source via rusqlite's
//!   `bundled` feature.
//! - `encryption`: SQLCipher-backed encrypted storage, mutually
//!   exclusive with `bundled-sqlite`.
//! - `embeddings` (default): local ONNX embedding and cross-encoder
//!   reranking via `fastembed`.
//! - `metal`: Apple GPU acceleration for `embeddings` inference.
//! - `full`: all of the above.
//! - `test-support`: exposes `llm::fixtures::FakeLlmClient` outside
//!   this crate, for the sibling `tests/e2e` crate's scenario fixtures.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod bank;
pub mod consolidation;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod llm;
pub mod memory;
pub mod operations;
pub mod reflection;
pub mod retain;
pub mod search;
pub mod storage;
pub mod tags;

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
pub mod embeddings;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Bank lifecycle and hierarchical config resolution.
pub use bank::{create_bank, delete_bank, get_bank, list_banks, resolve_config, EngineDefaults, ResolvedConfig, DEFAULT_LLM_BATCH_SIZE};

// Memory domain model.
pub use memory::{new_id, Bank, BankConfig, Directive, Document, FactType, HistoryAction, HistoryEntry, MemoryUnit, MentalModel};

// Tag-set scoping.
pub use tags::{TagMatchMode, TagSet};

// Error taxonomy.
pub use error::{EngineError, Result};

// LLM client contract.
pub use llm::{call_structured, CallScope, HttpLlmClient, LlmClient, LlmConfig, Message};

#[cfg(feature = "test-support")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub use llm::fixtures::FakeLlmClient;

// Storage layer.
pub use storage::{BankExport, OperationRow, Storage};

// Retain-time fact extraction and deduplication.
pub use dedup::{filter_duplicates, EmbeddedFact, DEDUP_WINDOW, DEFAULT_SIMILARITY_THRESHOLD};
pub use extract::{chunk_text, extract_facts, ExtractedFact, ResolvedFact, CHUNK_OVERLAP_CHARS, CHUNK_SIZE_CHARS};

// Consolidation engine.
pub use consolidation::{run_consolidation, ConsolidationOutcome, DEFAULT_BATCH_THRESHOLD};

// Async operation tracking.
pub use operations::{
    children_of, fail, finish, metadata_of, start, BatchRetainChildMetadata, BatchRetainParentMetadata,
    ConsolidationMetadata, OperationKind, RefreshMentalModelMetadata, RetainMetadata,
};

// Reflection (recall + synthesis).
pub use reflection::{reflect, BasedOn, ReflectionResult};

// Retain pipeline (extract + embed + dedup + persist).
pub use retain::{retain, RetainOutcome, RetainRequest};

// Hybrid retrieval.
pub use search::{
    assemble_chunks, assemble_recall, cluster_and_select, linear_combination, rank_by_recency, reciprocal_rank_fusion,
    recall, sanitize_fts5_query, strip_pipe_metadata, ChunkAttachment, ClusterRepresentative, HybridSearchConfig,
    HybridSearcher, RecallConfig, RecallOutcome, RecallRequest, RecallResult, RerankedResult, Reranker, RerankerConfig,
    RerankerError, TemporalCandidate, VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError,
    DEFAULT_CONNECTIVITY, DEFAULT_DIMENSIONS, DEFAULT_RERANK_COUNT, DEFAULT_RETRIEVAL_COUNT,
};

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
pub use embeddings::{
    cosine_similarity, dot_product, euclidean_distance, matryoshka_truncate, Embedding, EmbeddingError,
    EmbeddingProvider, EmbeddingService, BATCH_SIZE, EMBEDDING_DIMENSIONS, MAX_TEXT_LENGTH, NATIVE_DIMENSIONS,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default local embedding model: nomic-embed-text-v1.5, 768 native
/// dimensions, Matryoshka-truncatable to any smaller bank dimension.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-ai/nomic-embed-text-v1.5";

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::{
        Bank, BankConfig, Directive, EngineError, FactType, LlmClient, MemoryUnit, MentalModel, RecallConfig,
        RecallRequest, ReflectionResult, Result, RetainRequest, Storage, TagMatchMode, TagSet,
    };

    #[cfg(feature = "embeddings")]
    pub use crate::{Embedding, EmbeddingService};

    pub use crate::{VectorIndex, VectorIndexConfig};
}
