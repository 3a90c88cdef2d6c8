//! Search Module
//!
//! The hybrid retrieval pipeline (SPEC_FULL.md §4.6): dense (vector),
//! sparse (FTS5/BM25), and temporal candidate pools fused by RRF,
//! reranked by a cross-encoder, then clustered for diversity.

mod diversity;
mod hybrid;
mod keyword;
mod recall;
mod reranker;
mod temporal;
mod vector;

pub use vector::{
    VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError, DEFAULT_CONNECTIVITY,
    DEFAULT_DIMENSIONS,
};

pub use keyword::sanitize_fts5_query;

pub use hybrid::{linear_combination, reciprocal_rank_fusion, HybridSearchConfig, HybridSearcher};

pub use temporal::{rank_by_recency, TemporalCandidate};

pub use reranker::{
    Reranker, RerankerConfig, RerankerError, RerankedResult,
    DEFAULT_RERANK_COUNT, DEFAULT_RETRIEVAL_COUNT,
};

pub use diversity::{cluster_and_select, strip_pipe_metadata, ClusterRepresentative};

pub use recall::{
    assemble_chunks, assemble_recall, recall, ChunkAttachment, RecallConfig, RecallOutcome, RecallRequest, RecallResult,
};
