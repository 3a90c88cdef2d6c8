//! The memory domain model: banks, memory units, documents, and the
//! temporal priority rule used across recall, dedup, and consolidation.
//!
//! See SPEC_FULL.md §3 for the authoritative shapes. This module only
//! defines data; storage lives in `storage`, scoring lives in `search`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tags::TagSet;

/// What kind of fact a memory unit records. Drives both the retain-time
/// extraction rules (§4.2) and the diversity type bonus (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    /// Something that happened to or was done by the subject.
    Experience,
    /// A general, time-invariant fact about the world.
    World,
    /// A belief, preference, or subjective judgment.
    Opinion,
    /// A consolidation-engine synthesis over multiple underlying memories.
    /// Carries `source_memory_ids`, `proof_count`, and `history`; never
    /// produced directly by the fact extractor.
    Observation,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::Experience => "experience",
            FactType::World => "world",
            FactType::Opinion => "opinion",
            FactType::Observation => "observation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "experience" => Some(FactType::Experience),
            "world" => Some(FactType::World),
            "opinion" => Some(FactType::Opinion),
            "observation" => Some(FactType::Observation),
            _ => None,
        }
    }
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bank is the top-level isolation unit: its own embedding dimension,
/// its own rows, never joined across banks at query time (§3.1).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bank {
    pub id: String,
    pub name: String,
    pub embedding_dim: usize,
    pub created_at: DateTime<Utc>,
    pub config: BankConfig,
}

/// Per-bank overrides layered over engine defaults (§9 config resolution
/// design note: defaults → bank overrides → call-site overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankConfig {
    pub dedup_similarity_threshold: Option<f32>,
    pub diversity_similarity_threshold: Option<f32>,
    pub consolidation_batch_size: Option<usize>,
    /// Per-LLM-call chunk size within a tag-group batch (§4.5.1 step 3)
    /// — distinct from `consolidation_batch_size`, which is the
    /// minimum tag-group size worth processing at all.
    pub consolidation_llm_batch_size: Option<usize>,
}

/// The unit of recall: one fact, with its provenance, embedding, tags,
/// and temporal fields. See SPEC_FULL.md §3.2.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUnit {
    pub id: String,
    pub bank_id: String,
    pub fact_type: FactType,
    pub text: String,

    /// Dense embedding of `text`, dimension must equal the bank's
    /// `embedding_dim`. `None` only transiently, before embedding runs.
    pub embedding: Option<Vec<f32>>,

    pub tags: TagSet,

    /// The document this fact was extracted from, if any (manual
    /// `retain()` calls with no source document leave this `None`).
    pub document_id: Option<String>,

    // --- Temporal fields (§3.5 best-date priority rule) ---
    /// A single point-in-time the fact describes, e.g. "turned 30 on
    /// 2024-03-01". Mutually exclusive with occurred_start/end in
    /// well-formed facts, but both may be set by extraction noise.
    pub event_date: Option<DateTime<Utc>>,
    /// Start of a described interval, e.g. "lived in Boston 2019-2022".
    pub occurred_start: Option<DateTime<Utc>>,
    /// End of a described interval. `None` with `occurred_start` set
    /// means "ongoing as of consolidation".
    pub occurred_end: Option<DateTime<Utc>>,
    /// When the fact was mentioned in the source conversation/document,
    /// as opposed to when the fact is about.
    pub mentioned_at: Option<DateTime<Utc>>,

    /// Ingestion timestamp. Always present; the final fallback in the
    /// best-date chain.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set only when a consolidation run folded this unit into a later
    /// observation; excludes it from direct recall candidate pools
    /// (§4.5 invalidation).
    pub consolidated_at: Option<DateTime<Utc>>,

    // --- Observation-only fields (fact_type == Observation) ---
    /// IDs of the memory units this observation was synthesized from.
    /// Empty for non-observations.
    pub source_memory_ids: Vec<String>,
    /// How many source facts this observation cites: always equal to
    /// `source_memory_ids.len()` (§3, §4.5.2). Non-observations are
    /// always 0.
    pub proof_count: u32,
    /// Append-only audit log of consolidation actions that touched this
    /// observation, newest last. Empty for non-observations. See
    /// SPEC_FULL.md §4.5 [FULL] on the append-only decision.
    pub history: Vec<HistoryEntry>,
}

impl MemoryUnit {
    /// The best single date to represent this memory for recency scoring,
    /// temporal-window queries, and dedup bucketing, per §3's priority
    /// chain: `mentioned_at` (user-provided, authoritative) outranks
    /// everything else; then the midpoint of `occurred_start`/
    /// `occurred_end` if both are present; then whichever of the two is
    /// present alone; then `created_at` as the final fallback. This order
    /// is load-bearing for the "temporal priority" testable property
    /// (§8): an LLM-extracted `occurred_start` must never outrank a
    /// user-supplied `mentioned_at`.
    pub fn best_date(&self) -> DateTime<Utc> {
        if let Some(mentioned) = self.mentioned_at {
            return mentioned;
        }
        match (self.occurred_start, self.occurred_end) {
            (Some(start), Some(end)) => start + (end - start) / 2,
            (Some(start), None) => start,
            (None, Some(end)) => end,
            (None, None) => self.event_date.unwrap_or(self.created_at),
        }
    }

    pub fn is_observation(&self) -> bool {
        matches!(self.fact_type, FactType::Observation)
    }

    /// True once a consolidation run has superseded this unit; such
    /// units are excluded from fresh recall candidate pools but remain
    /// addressable by ID (e.g. as an observation's `source_memory_ids`).
    pub fn is_consolidated_away(&self) -> bool {
        self.consolidated_at.is_some()
    }
}

/// One append-only entry in an observation's audit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub operation_id: String,
    pub action: HistoryAction,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Reinforced,
    Updated,
    Invalidated,
}

/// A source document ingested via the retain pipeline, chunked into
/// memory units (§3.3). Chunking itself lives in `extract`.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub bank_id: String,
    pub title: Option<String>,
    pub raw_text: String,
    pub tags: TagSet,
    pub created_at: DateTime<Utc>,
}

/// A synthesized cross-memory summary maintained by the consolidation
/// engine's mental-model refresh step (§4.5.3), scoped by tag set like
/// everything else.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentalModel {
    pub id: String,
    pub bank_id: String,
    pub tags: TagSet,
    pub summary: String,
    pub based_on: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// A standing instruction that shapes future consolidation/reflection
/// behavior for a tag scope (§3.6), e.g. "prefer concise observations".
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    pub id: String,
    pub bank_id: String,
    pub tags: TagSet,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
