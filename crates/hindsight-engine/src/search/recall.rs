//! Hybrid recall pipeline orchestration (SPEC_FULL.md §4.6).
//!
//! The eight-step pipeline: gather dense/sparse/temporal candidate
//! pools in parallel, fuse with RRF, apply the tag-scope filter, rerank
//! the fused top-N with the cross-encoder, cluster for diversity, then
//! assemble a token-budgeted result. This module owns steps 4-8 (fusion
//! onward) as pure functions over candidate data; `storage::Storage`
//! owns steps 1-3 (the three candidate-pool queries) since those need a
//! database connection. Keeping the scoring logic storage-agnostic
//! makes it unit-testable without a live `Storage`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::memory::{Document, MemoryUnit};
use crate::search::diversity::{cluster_and_select, strip_pipe_metadata, DiversityCandidate};
use crate::search::hybrid::reciprocal_rank_fusion;
use crate::search::reranker::{Reranker, RerankerConfig};
use crate::storage::Storage;
use crate::tags::{TagMatchMode, TagSet};

#[derive(Debug, Clone)]
pub struct RecallConfig {
    pub rrf_k: f32,
    pub diversity_threshold: f32,
    pub rerank_candidate_count: usize,
    pub result_limit: usize,
    pub token_budget: Option<usize>,
    pub tag_mode: TagMatchMode,
    /// Whether to attach document chunks alongside facts (§4.6 step 8).
    /// Chunk fetching is independent of `token_budget`: a caller can ask
    /// for `token_budget = Some(0)` and still get chunks back.
    pub include_chunks: bool,
    /// Byte budget (estimated chars/4, like `token_budget`) for chunk
    /// text, applied on top of the top-ranked candidates regardless of
    /// how `token_budget` trimmed the fact list itself.
    pub max_chunk_tokens: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            diversity_threshold: 0.75,
            rerank_candidate_count: 50,
            result_limit: 10,
            token_budget: None,
            tag_mode: TagMatchMode::Any,
            include_chunks: false,
            max_chunk_tokens: 0,
        }
    }
}

pub struct RecallRequest {
    pub query: String,
    pub tags: TagSet,
    pub config: RecallConfig,
}

#[derive(Debug, Clone)]
pub struct RecallResult {
    pub memory_id: String,
    pub score: f32,
    pub cluster_size: usize,
}

/// One document chunk attached to a recall response (§4.6 step 8).
#[derive(Debug, Clone, Serialize)]
pub struct ChunkAttachment {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk_text: String,
}

/// What `assemble_recall` produces: the token-budgeted fact list plus
/// the full pre-budget score order, which chunk attachment draws on so
/// `token_budget = 0` doesn't starve `chunks` of candidates to source
/// from (testable property: chunk independence).
#[derive(Debug, Clone, Default)]
pub struct RecallOutcome {
    pub results: Vec<RecallResult>,
    pub ranked: Vec<RecallResult>,
    pub chunks: Vec<ChunkAttachment>,
}

/// Fuse dense + sparse + temporal candidate pools (already fetched by
/// the caller, one `(id, score)` list each), apply the tag filter
/// against each candidate's own tags, rerank the fused top-N against
/// full memory text, cluster for diversity, and return a token-budgeted
/// final list.
///
/// `candidates` supplies, per memory id, the data needed for tag
/// filtering, reranking, and diversity scoring — callers assemble this
/// from whatever rows the three candidate-pool queries returned plus a
/// `fetch_by_ids`-style hydration pass.
pub fn assemble_recall(
    request: &RecallRequest,
    dense: &[(String, f32)],
    sparse: &[(String, f32)],
    temporal: &[(String, f32)],
    candidates: &[MemoryUnit],
    now: DateTime<Utc>,
) -> RecallOutcome {
    let fused_dense_sparse = reciprocal_rank_fusion(sparse, dense, request.config.rrf_k);
    let fused = fuse_with_temporal(&fused_dense_sparse, temporal, request.config.rrf_k);

    let by_id: std::collections::HashMap<&str, &MemoryUnit> =
        candidates.iter().map(|m| (m.id.as_str(), m)).collect();

    let tag_filtered: Vec<(String, f32)> = fused
        .into_iter()
        .filter(|(id, _)| {
            by_id
                .get(id.as_str())
                .is_some_and(|m| request.config.tag_mode.matches(&m.tags, &request.tags))
        })
        .collect();

    let rerank_pool: Vec<(String, String)> = tag_filtered
        .iter()
        .take(request.config.rerank_candidate_count)
        .filter_map(|(id, _)| by_id.get(id.as_str()).map(|m| (id.clone(), strip_pipe_metadata(&m.text))))
        .collect();

    let mut reranker = Reranker::new(RerankerConfig {
        candidate_count: request.config.rerank_candidate_count,
        result_count: request.config.rerank_candidate_count,
        min_score: None,
    });

    let reranked = if request.query.trim().is_empty() {
        let n = rerank_pool.len().max(1) as f32;
        rerank_pool
            .into_iter()
            .enumerate()
            .map(|(rank, (id, _))| (id, 1.0 - rank as f32 / n))
            .collect::<Vec<_>>()
    } else {
        reranker
            .rerank(&request.query, rerank_pool, None)
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.item, r.score))
            .collect()
    };

    let diversity_candidates: Vec<DiversityCandidate> = reranked
        .iter()
        .filter_map(|(id, score)| {
            by_id.get(id.as_str()).map(|m| DiversityCandidate {
                id: m.id.clone(),
                text: m.text.clone(),
                embedding: m.embedding.clone().unwrap_or_default(),
                is_observation: m.is_observation(),
                is_experience: matches!(m.fact_type, crate::memory::FactType::Experience),
                best_date: m.best_date(),
                query_similarity: *score,
            })
        })
        .collect();

    let representatives = cluster_and_select(&diversity_candidates, request.config.diversity_threshold, now);

    // §4.6 step 8: representatives are already sorted by composite score
    // (`cluster_and_select`'s own ordering), and that composite score --
    // not the bare rerank/query-similarity value -- is what a result's
    // `score` carries, so diversity/recency/type bonuses survive into
    // the emitted list instead of only deciding cluster representatives.
    let mut ranked: Vec<RecallResult> = representatives
        .into_iter()
        .map(|r| RecallResult {
            memory_id: r.id,
            score: r.score,
            cluster_size: r.cluster_size,
        })
        .collect();
    ranked.truncate(request.config.result_limit);

    let mut results = ranked.clone();
    apply_token_budget(&mut results, &by_id, request.config.token_budget);
    results.truncate(request.config.result_limit);

    RecallOutcome { results, ranked, chunks: Vec::new() }
}

/// Fetch document chunks for the top-ranked candidates, independent of
/// `token_budget`/`results`. Walks `ranked` in score order, pulls each
/// candidate's parent document (if any), re-chunks its `raw_text` with
/// the same splitter `extract` uses at retain time, and accumulates
/// chunks until `max_chunk_tokens` is spent — always admitting at least
/// one chunk so a budget smaller than a single chunk doesn't starve the
/// response entirely.
pub fn assemble_chunks(
    ranked: &[RecallResult],
    candidates_by_id: &HashMap<&str, &MemoryUnit>,
    documents_by_id: &HashMap<String, Document>,
    max_chunk_tokens: usize,
) -> Vec<ChunkAttachment> {
    let mut seen = HashSet::new();
    let mut attachments = Vec::new();
    let mut spent = 0usize;

    for r in ranked {
        let Some(memory) = candidates_by_id.get(r.memory_id.as_str()) else { continue };
        let Some(document_id) = memory.document_id.as_ref() else { continue };
        let Some(document) = documents_by_id.get(document_id) else { continue };

        for (index, text) in crate::extract::chunk_text(&document.raw_text).into_iter().enumerate() {
            let chunk_id = format!("{document_id}:{index}");
            if !seen.insert(chunk_id.clone()) {
                continue;
            }
            let tokens = text.len() / 4;
            if !attachments.is_empty() && spent + tokens > max_chunk_tokens {
                return attachments;
            }
            spent += tokens;
            attachments.push(ChunkAttachment { chunk_id, document_id: document_id.clone(), chunk_index: index, chunk_text: text });
        }
    }
    attachments
}

/// Full hybrid recall (§4.6, all eight steps): gathers the three
/// candidate pools from `storage`, fuses/reranks/clusters/budgets them
/// via [`assemble_recall`], and — when `request.config.include_chunks`
/// is set — independently attaches document chunks sourced from the
/// top-ranked candidates. This is the engine's one fully-wired recall
/// entry point; `reflection::reflect` runs its own copy of steps 1-6
/// because it needs the hydrated `MemoryUnit`s for synthesis, not just
/// scored IDs.
pub fn recall(
    storage: &Storage,
    bank_id: &str,
    request: &RecallRequest,
    query_embedding: &[f32],
    now: DateTime<Utc>,
) -> Result<RecallOutcome> {
    let pool = request.config.rerank_candidate_count.max(request.config.result_limit);
    let dense = storage.candidates_by_dense(bank_id, query_embedding, pool)?;
    let sparse = storage.candidates_by_sparse(bank_id, &request.query, pool)?;
    let temporal = storage.candidates_by_temporal(bank_id, now, pool)?;

    let candidate_ids: HashSet<String> =
        dense.iter().chain(sparse.iter()).chain(temporal.iter()).map(|(id, _)| id.clone()).collect();
    let candidates = storage.fetch_by_ids(&candidate_ids.into_iter().collect::<Vec<_>>())?;

    let mut outcome = assemble_recall(request, &dense, &sparse, &temporal, &candidates, now);

    if request.config.include_chunks {
        let by_id: HashMap<&str, &MemoryUnit> = candidates.iter().map(|m| (m.id.as_str(), m)).collect();
        let document_ids: Vec<String> = outcome
            .ranked
            .iter()
            .filter_map(|r| by_id.get(r.memory_id.as_str()).and_then(|m| m.document_id.clone()))
            .collect();
        let documents = storage.fetch_documents(&document_ids)?;
        let documents_by_id: HashMap<String, Document> = documents.into_iter().map(|d| (d.id.clone(), d)).collect();
        outcome.chunks = assemble_chunks(&outcome.ranked, &by_id, &documents_by_id, request.config.max_chunk_tokens);
    }

    Ok(outcome)
}

fn fuse_with_temporal(primary: &[(String, f32)], temporal: &[(String, f32)], k: f32) -> Vec<(String, f32)> {
    if temporal.is_empty() {
        return primary.to_vec();
    }
    reciprocal_rank_fusion(primary, temporal, k)
}

/// Trim the tail of `results` so the sum of (roughly 4 chars/token)
/// estimated token counts for surviving memories stays under budget.
/// Token budgeting happens after diversity selection, not before, so a
/// tight budget prefers fewer distinct facts over truncating any one.
fn apply_token_budget(
    results: &mut Vec<RecallResult>,
    by_id: &std::collections::HashMap<&str, &MemoryUnit>,
    budget: Option<usize>,
) {
    let Some(budget) = budget else { return };
    if budget == 0 {
        results.clear();
        return;
    }
    let mut spent = 0usize;
    let mut cutoff = results.len();
    for (i, r) in results.iter().enumerate() {
        let tokens = by_id.get(r.memory_id.as_str()).map(|m| m.text.len() / 4).unwrap_or(0);
        if spent + tokens > budget && i > 0 {
            cutoff = i;
            break;
        }
        spent += tokens;
    }
    results.truncate(cutoff);
}
