//! Engine-wide error taxonomy.
//!
//! One enum covers every component boundary named in the error handling
//! design: validation, not-found, conflict, transient storage, LLM
//! transient/output-too-long, authorization, and fatal. Components retry
//! internally where the design assigns them the retry (storage, LLM
//! client); callers above them just match on variants.

use thiserror::Error;

/// Crate-wide result alias, mirrored per-module the way the teacher aliases
/// `storage::sqlite::Result`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: bad UUID, empty bank_id, non-string tag, etc.
    /// Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// A referenced bank/memory/operation/document does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Embedding dimension mismatch, or a race left an observation citing
    /// a source that no longer exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection blip, lock contention. The storage layer already retried
    /// with backoff before giving up and surfacing this.
    #[error("storage transient error: {0}")]
    StorageTransient(#[from] rusqlite::Error),

    /// Rate limit, timeout, or transport failure from the LLM client,
    /// surfaced after its own retry budget is exhausted.
    #[error("llm transient error: {0}")]
    LlmTransient(String),

    /// The LLM's response exceeded its output token budget. Splittable:
    /// callers should subdivide the input and retry at a smaller chunk
    /// size rather than treat this as fatal.
    #[error("llm output exceeded length limit")]
    LlmOutputTooLong,

    /// A consolidation action referenced an observation outside its
    /// fact's authorized recall set. The action is rejected; sibling
    /// actions in the same batch still proceed.
    #[error("authorization: {0}")]
    Authorization(String),

    /// Migration failure, or an attempt to change a bank's embedding
    /// dimension with existing rows. No recovery path.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    /// True for errors the caller may reasonably retry the whole
    /// operation for (as opposed to validation/authorization/fatal,
    /// which will fail again identically).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageTransient(_) | EngineError::LlmTransient(_))
    }
}
