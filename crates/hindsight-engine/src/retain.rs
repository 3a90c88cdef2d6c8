//! Retain pipeline (SPEC_FULL.md §4 component 7): orchestrates fact
//! extraction, embedding, deduplication, and persistence for one
//! ingested piece of content. This is the glue component named in the
//! system-overview table as "Orchestrates (5)+(6)+(1)+(4)" — the
//! extractor, deduplication, embedding provider, and storage layer each
//! own one concern; `retain` is the only place that sequences them.
//!
//! Content above the extractor's chunk size is first persisted as a
//! [`Document`] so later recall can attach chunks back to it (§4.6 step
//! 8); short content that fits in a single chunk is retained directly
//! against the bank with no document row, matching the original's
//! distinction between a bare fact and an ingested document.

use chrono::{DateTime, Utc};

use crate::dedup::{filter_duplicates, EmbeddedFact};
use crate::embeddings::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::extract::{extract_facts, ResolvedFact, CHUNK_SIZE_CHARS};
use crate::llm::LlmClient;
use crate::memory::{new_id, Document, MemoryUnit};
use crate::storage::Storage;
use crate::tags::TagSet;

/// One `retain()` call. `event_date` is the call's temporal anchor —
/// the caller-supplied instant relative expressions inside `content`
/// resolve against (§4.2); `mentioned_at`, when present, is the
/// user-asserted "when this was said" timestamp that always outranks
/// whatever the extractor infers (§3 temporal priority rule).
#[derive(Debug, Clone)]
pub struct RetainRequest {
    pub bank_id: String,
    pub content: String,
    pub event_date: DateTime<Utc>,
    pub mentioned_at: Option<DateTime<Utc>>,
    pub tags: TagSet,
    pub document_title: Option<String>,
    pub similarity_threshold: f32,
}

/// What one `retain()` call produced.
#[derive(Debug, Clone, Default)]
pub struct RetainOutcome {
    /// Set when `content` was large enough to be stored as a document
    /// in its own right (see module doc comment).
    pub document_id: Option<String>,
    pub memory_ids: Vec<String>,
    /// How many extracted facts were dropped as duplicates (§4.3),
    /// either of existing rows or of an earlier fact in this same call.
    pub duplicates_filtered: usize,
}

/// Extract facts from `request.content`, embed them, deduplicate
/// against the bank and within the batch, and persist the survivors —
/// tagged and dated per §3's invariants. Returns the new memory IDs in
/// extraction order (duplicates removed), never partially: a storage
/// write failure partway through surfaces to the caller with whatever
/// wrote so far already committed (row-level writes, not one
/// transaction, per §4.1 — the storage layer doesn't promise atomicity
/// across a whole retain batch, only within each row).
pub async fn retain(
    storage: &Storage,
    llm: &dyn LlmClient,
    embeddings: &dyn EmbeddingProvider,
    request: RetainRequest,
) -> Result<RetainOutcome> {
    let now = Utc::now();

    let document_id = if request.content.len() > CHUNK_SIZE_CHARS {
        let document = Document {
            id: new_id(),
            bank_id: request.bank_id.clone(),
            title: request.document_title.clone(),
            raw_text: request.content.clone(),
            tags: request.tags.clone(),
            created_at: now,
        };
        storage.insert_document(&document)?;
        Some(document.id)
    } else {
        None
    };

    let resolved = extract_facts(llm, &request.content, request.event_date).await?;
    if resolved.is_empty() {
        return Ok(RetainOutcome { document_id, memory_ids: vec![], duplicates_filtered: 0 });
    }

    let texts: Vec<&str> = resolved.iter().map(|f| f.text.as_str()).collect();
    let vectors = embeddings.encode(&texts).map_err(|e| EngineError::Validation(e.to_string()))?;
    if vectors.len() != resolved.len() {
        return Err(EngineError::Validation(format!(
            "embedding provider returned {} vectors for {} facts",
            vectors.len(),
            resolved.len()
        )));
    }

    let candidates: Vec<EmbeddedFact> = resolved
        .into_iter()
        .zip(vectors)
        .map(|(fact, embedding)| {
            let best_date = best_date_of(&fact, request.mentioned_at, now);
            EmbeddedFact { fact, embedding, best_date }
        })
        .collect();

    let before = candidates.len();
    let survivors = filter_duplicates(storage, &request.bank_id, candidates, request.similarity_threshold)?;
    let duplicates_filtered = before - survivors.len();

    let mut memory_ids = Vec::with_capacity(survivors.len());
    for survivor in survivors {
        let unit = MemoryUnit {
            id: new_id(),
            bank_id: request.bank_id.clone(),
            fact_type: survivor.fact.fact_type,
            text: survivor.fact.text,
            embedding: Some(survivor.embedding),
            tags: request.tags.clone(),
            document_id: document_id.clone(),
            event_date: survivor.fact.event_date,
            occurred_start: survivor.fact.occurred_start,
            occurred_end: survivor.fact.occurred_end,
            mentioned_at: request.mentioned_at,
            created_at: now,
            updated_at: now,
            consolidated_at: None,
            source_memory_ids: vec![],
            proof_count: 0,
            history: vec![],
        };
        storage.insert_memory(&unit)?;
        memory_ids.push(unit.id);
    }

    Ok(RetainOutcome { document_id, memory_ids, duplicates_filtered })
}

/// The temporal priority chain (§3): `mentioned_at` (call-level,
/// authoritative) beats the midpoint of `occurred_start`/`occurred_end`,
/// which beats whichever single bound is present, which beats the
/// extracted `event_date`, which beats `now` as a last resort. Mirrors
/// [`MemoryUnit::best_date`] so a fact's dedup-time window matches the
/// window it will be scored against after insertion.
fn best_date_of(fact: &ResolvedFact, mentioned_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(mentioned) = mentioned_at {
        return mentioned;
    }
    match (fact.occurred_start, fact.occurred_end) {
        (Some(start), Some(end)) => start + (end - start) / 2,
        (Some(start), None) => start,
        (None, Some(end)) => end,
        (None, None) => fact.event_date.unwrap_or(now),
    }
}
